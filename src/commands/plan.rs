//! `fleet plan` - preview what apply would change

use anyhow::Result;
use fleetkit::{ReconcileContext, reconcile};

use super::{Session, render};
use crate::Context;
use crate::cli::TargetArgs;
use crate::progress::TerminalObserver;
use crate::ui;

pub fn run(ctx: &Context, args: &TargetArgs) -> Result<()> {
    let session = Session::open(args)?;
    let observer = TerminalObserver::new(ctx.quiet || args.json);
    let preview_ctx = ReconcileContext::new(true)
        .with_settings(session.settings.engine())
        .with_observer(&observer);

    if !ctx.quiet && !args.json {
        ui::header(&format!("Plan for {}", args.declaration.display()));
    }

    let plan = match reconcile(&session.cloud, &session.declaration, &preview_ctx) {
        Ok(plan) => plan,
        Err(err) => {
            render::failure(&err);
            return Err(err.into());
        }
    };

    if args.json {
        return render::json(&plan);
    }
    render::result(&plan, true);
    Ok(())
}
