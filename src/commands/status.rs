//! `fleet status` - show the instances a declaration matches

use anyhow::Result;
use fleetkit::matcher::{self, Selector};

use super::{Session, render};
use crate::Context;
use crate::cli::TargetArgs;
use crate::ui;

pub fn run(ctx: &Context, args: &TargetArgs) -> Result<()> {
    let session = Session::open(args)?;
    let declaration = &session.declaration;

    let selector = matcher::selector_for(&session.cloud, declaration)?;
    let instances = matcher::find(&session.cloud, &selector, declaration.state)?;

    if args.json {
        return render::json(&instances);
    }

    if !ctx.quiet {
        ui::header(&format!("Status for {}", args.declaration.display()));
        match &selector {
            Selector::Identifiers(ids) => ui::kv("ids", &ui::ids(ids)),
            Selector::Filter(filter) => {
                for (key, values) in filter.iter() {
                    ui::kv(key, &values.join(", "));
                }
            }
            Selector::Nothing => ui::dim("Nothing identifies an existing population"),
        }
        ui::kv("target", declaration.state.as_str());
        println!();
    }

    if instances.is_empty() {
        ui::info("No matching instances");
        return Ok(());
    }

    for instance in &instances {
        println!("  {}", ui::instance_line(instance));
    }

    let settled = instances
        .iter()
        .filter(|&i| declaration.state.wait_condition().is_met(Some(i)))
        .count();
    println!();
    ui::info(&format!(
        "{} instance(s), {} at {}",
        instances.len(),
        settled,
        declaration.state.wait_condition()
    ));
    Ok(())
}
