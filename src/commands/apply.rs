//! `fleet apply` - converge the cloud to a declaration

use anyhow::Result;
use colored::Colorize;
use fleetkit::{NoObserver, ReconcileContext, reconcile};

use super::{Session, render};
use crate::Context;
use crate::cli::ApplyArgs;
use crate::progress::TerminalObserver;
use crate::ui;

pub fn run(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let session = Session::open(&args.target)?;
    let engine = session.settings.engine();
    let json = args.target.json;

    // Preview without observer noise; the real pass reports progress
    let preview_ctx = ReconcileContext::new(true)
        .with_settings(engine)
        .with_observer(&NoObserver);
    let plan = match reconcile(&session.cloud, &session.declaration, &preview_ctx) {
        Ok(plan) => plan,
        Err(err) => {
            render::failure(&err);
            return Err(err.into());
        }
    };

    if !plan.changed || args.dry_run {
        if json {
            return render::json(&plan);
        }
        render::result(&plan, true);
        if plan.changed && !ctx.quiet {
            println!();
            println!("  {} Dry run - no changes made", "ℹ".blue());
        }
        return Ok(());
    }

    if !json {
        render::result(&plan, true);
    }

    if !args.yes && !confirm_proceed()? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(());
    }

    let observer = TerminalObserver::new(ctx.quiet || json);
    let apply_ctx = ReconcileContext::new(false)
        .with_settings(engine)
        .with_observer(&observer);
    let outcome = reconcile(&session.cloud, &session.declaration, &apply_ctx);

    // Whatever was launched or transitioned before a failure is real
    session.save()?;

    match outcome {
        Ok(result) => {
            if json {
                render::json(&result)
            } else {
                if !ctx.quiet {
                    ui::header("Applied");
                }
                render::result(&result, false);
                Ok(())
            }
        }
        Err(err) => {
            render::failure(&err);
            Err(err.into())
        }
    }
}

/// Confirm with user
fn confirm_proceed() -> Result<bool> {
    use dialoguer::Confirm;

    println!();
    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(true)
        .interact()?;

    Ok(confirmed)
}
