use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(version)]
#[command(about = "Declarative reconciliation of compute instances", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Converge the cloud to a declaration
    Apply(ApplyArgs),

    /// Preview what apply would change
    Plan(TargetArgs),

    /// Show the instances a declaration matches
    Status(TargetArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct TargetArgs {
    /// Declaration file (TOML)
    pub declaration: PathBuf,

    /// Simulated cloud file (defaults to the state directory)
    #[arg(long, env = "FLEET_CLOUD_FILE")]
    pub cloud: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Show what would change without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from([
            "fleet",
            "-vv",
            "apply",
            "web.toml",
            "--cloud",
            "/tmp/cloud.json",
            "--yes",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Apply(args) => {
                assert_eq!(args.target.declaration, PathBuf::from("web.toml"));
                assert_eq!(args.target.cloud, Some(PathBuf::from("/tmp/cloud.json")));
                assert!(args.yes);
                assert!(!args.dry_run);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_parse_plan_json() {
        let cli = Cli::try_parse_from(["fleet", "plan", "web.toml", "--json", "-q"]).unwrap();
        assert!(cli.quiet);
        match cli.command {
            Command::Plan(args) => assert!(args.json),
            _ => panic!("expected plan"),
        }
    }
}
