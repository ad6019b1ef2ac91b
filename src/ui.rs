use colored::Colorize;
use fleetkit::{InstanceState, LiveInstance};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Colored lifecycle state
pub fn state(state: InstanceState) -> String {
    let text = state.as_str();
    match state {
        InstanceState::Running => text.green().to_string(),
        InstanceState::Stopped => text.yellow().to_string(),
        InstanceState::Terminated | InstanceState::ShuttingDown => text.red().to_string(),
        InstanceState::Pending | InstanceState::Stopping => text.cyan().to_string(),
    }
}

/// One line per instance: id, state, type, name, launch time
pub fn instance_line(instance: &LiveInstance) -> String {
    format!(
        "{}  {:<13}  {:<10}  {:<16}  {}",
        instance.id.bold(),
        state(instance.state),
        instance.instance_type,
        instance.name().unwrap_or("-"),
        instance
            .launch_time
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    )
}

/// Join ids for display, `-` when empty
pub fn ids(ids: &[String]) -> String {
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.join(", ")
    }
}
