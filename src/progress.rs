//! Progress rendering for a reconciliation pass

use colored::Colorize;
use fleetkit::{Observer, WaitCondition, WaitStatus};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// Create a spinner with a message
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Renders engine events on the terminal
///
/// Waits get a spinner; actions, fallbacks and advisories are printed as
/// they happen. Quiet mode prints nothing.
pub struct TerminalObserver {
    quiet: bool,
    active: Mutex<Option<ProgressBar>>,
}

impl TerminalObserver {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            active: Mutex::new(None),
        }
    }

    fn println(&self, line: String) {
        if self.quiet {
            return;
        }
        let active = self
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match active.as_ref() {
            Some(pb) => pb.suspend(|| println!("{line}")),
            None => println!("{line}"),
        }
    }
}

impl Observer for TerminalObserver {
    fn on_wait_start(&self, ids: &[String], condition: WaitCondition) {
        if self.quiet {
            return;
        }
        let pb = spinner(&format!(
            "Waiting for {} instance(s): {}",
            ids.len(),
            condition
        ));
        *self
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pb);
    }

    fn on_wait_end(&self, condition: WaitCondition, status: &WaitStatus) {
        let pb = self
            .active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(pb) = pb else { return };
        match status {
            WaitStatus::TimedOut { pending } => pb.finish_with_message(format!(
                "{} {} timed out for {}",
                "⚠".yellow(),
                condition,
                pending.join(", ")
            )),
            _ => pb.finish_and_clear(),
        }
    }

    fn on_action(&self, action: &str, ids: &[String]) {
        let target = if ids.is_empty() {
            String::new()
        } else {
            format!(" {}", ids.join(", ").dimmed())
        };
        self.println(format!("  {} {action}{target}", "→".blue()));
    }

    fn on_fallback(&self, from: &str, to: &str, reason: &str) {
        self.println(format!(
            "  {} {from} unavailable, trying {to} ({})",
            "↻".yellow(),
            reason.dimmed()
        ));
    }

    fn on_advisory(&self, id: &str, message: &str) {
        self.println(format!("  {} {id}: {message}", "⚠".yellow()));
    }
}
