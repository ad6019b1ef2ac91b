//! Terminal rendering of reconciliation results

use anyhow::Result;
use colored::Colorize;
use fleetkit::{ChangeSet, CreationRequest, Error, InterfaceRequest, ReconciliationResult};
use serde::Serialize;

use crate::ui;

/// Print any serializable value as pretty JSON
pub fn json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Render a pass result; `preview` marks a dry-run
pub fn result(result: &ReconciliationResult, preview: bool) {
    if let Some(request) = &result.creation {
        creation(request, result.launched_type.as_deref());
    }

    let pending: Vec<&ChangeSet> = result
        .changes
        .iter()
        .filter(|set| !set.is_empty() || !set.advisories.is_empty())
        .collect();
    if !pending.is_empty() {
        ui::section("Changes");
        for set in pending {
            change_set(set);
        }
    }

    if !result.terminated_ids.is_empty() {
        ui::section(if preview { "Terminate" } else { "Terminated" });
        for id in &result.terminated_ids {
            println!("  {} {}", "-".red(), id);
        }
    }

    if !result.instances.is_empty() && !preview {
        ui::section("Instances");
        for instance in &result.instances {
            println!("  {}", ui::instance_line(instance));
        }
    }

    if !result.warnings.is_empty() {
        println!();
        for warning in &result.warnings {
            ui::warn(warning);
        }
    }

    println!();
    if result.changed {
        if preview {
            ui::info(&result.message);
        } else {
            ui::success(&result.message);
        }
    } else {
        ui::success(&format!("Up to date: {}", result.message));
    }
}

fn creation(request: &CreationRequest, launched_type: Option<&str>) {
    ui::section("Launch");
    ui::kv("count", &request.count.to_string());
    ui::kv(
        "instance type",
        request
            .instance_type
            .as_deref()
            .unwrap_or("from launch template"),
    );
    if !request.alternate_instance_types.is_empty() {
        ui::kv("alternates", &request.alternate_instance_types.join(", "));
    }
    if let Some(launched) = launched_type {
        ui::kv("launched as", launched);
    }
    if let Some(image) = &request.image_id {
        ui::kv("image", image);
    }
    if let Some(profile) = &request.iam_instance_profile {
        ui::kv("instance profile", profile);
    }
    for interface in &request.network_interfaces {
        let detail = match interface {
            InterfaceRequest::Existing { id, .. } => id.clone(),
            InterfaceRequest::New {
                subnet_id, groups, ..
            } if groups.is_empty() => format!("new in {subnet_id}"),
            InterfaceRequest::New {
                subnet_id, groups, ..
            } => format!("new in {subnet_id} ({})", groups.join(", ")),
        };
        ui::kv(&format!("eth{}", interface.device_index()), &detail);
    }
}

fn change_set(set: &ChangeSet) {
    println!("  {}", set.instance_id.bold());
    for change in &set.changes {
        println!("    {} {}", "~".yellow(), change);
    }
    for advisory in &set.advisories {
        println!("    {} {}", "!".yellow(), advisory.dimmed());
    }
}

/// Explain a failed pass, including which instances a batch touched
pub fn failure(err: &Error) {
    ui::error(&err.to_string());

    if let Error::PartialBatchFailure {
        succeeded, failed, ..
    } = err
    {
        ui::kv("succeeded", &ui::ids(succeeded));
        ui::kv("failed", &ui::ids(failed));
    }

    let category = err.category();
    ui::dim(&format!("{}: {}", category.description(), category.advice()));
}
