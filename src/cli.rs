use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative resource reconciler", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Declarations file (TOML or JSON)
    #[arg(short, long, global = true, env = "CONVERGE_FILE")]
    pub file: Option<PathBuf>,

    /// State file
    #[arg(long, global = true, env = "CONVERGE_STATE")]
    pub state: Option<PathBuf>,

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
    /// Preview what apply would change
    Plan(PlanArgs),

    /// Make real resources match the declarations
    Apply(ApplyArgs),

    /// Delete every resource recorded in state
    Destroy(ApplyArgs),

    /// Re-read recorded resources from their providers
    Refresh(RefreshArgs),

    /// Inspect or edit recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Plan / Apply
// ============================================================================

#[derive(Args)]
pub struct PlanArgs {
    /// Limit to resources by identity, type, or type package (repeatable)
    #[arg(short, long)]
    pub target: Vec<String>,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Limit to resources by identity, type, or type package (repeatable)
    #[arg(short, long)]
    pub target: Vec<String>,

    /// Number of parallel workers (defaults to settings)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Show the plan without making changes
    #[arg(long)]
    pub dry_run: bool,

    /// Start nothing new after the first failure
    #[arg(long)]
    pub halt_on_error: bool,
}

#[derive(Args)]
pub struct RefreshArgs {
    /// Number of parallel workers (defaults to settings)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Report drift without writing state
    #[arg(long)]
    pub dry_run: bool,
}

// ============================================================================
// State Commands
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded resources
    List,

    /// Show one recorded resource
    Show {
        /// Resource identity
        id: String,
    },

    /// Forget a resource without deleting it
    Rm {
        /// Resource identity
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
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
    fn test_apply_flags() {
        let cli = Cli::parse_from([
            "converge",
            "-f",
            "stack.toml",
            "apply",
            "-t",
            "rabbitmq",
            "--target",
            "database",
            "-j",
            "8",
            "--yes",
            "--halt-on-error",
        ]);
        assert_eq!(cli.file, Some(PathBuf::from("stack.toml")));
        let Command::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.target, vec!["rabbitmq", "database"]);
        assert_eq!(args.jobs, Some(8));
        assert!(args.yes);
        assert!(args.halt_on_error);
        assert!(!args.dry_run);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["converge", "state", "list", "-vv", "--state", "s.json"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.state, Some(PathBuf::from("s.json")));
        assert!(matches!(cli.command, Command::State(StateCommand::List)));
    }
}
