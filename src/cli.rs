use crate::data::Role;
use crate::data::visibility::Actor;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Retail data layer: cached, deduplicated loads with change-feed patching.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log output format
    #[arg(long, value_enum, default_value_t = default_tracing_format(), global = true)]
    pub tracing: TracingFormat,

    /// Optional TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load a fixture through the cache and print the actor's view as JSON
    Snapshot {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Load a fixture, apply change events from a JSON-lines file, print the result
    Replay {
        #[command(flatten)]
        source: SourceArgs,
        /// One change event per line
        #[arg(long)]
        events: PathBuf,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct SourceArgs {
    /// JSON file with the backend tables
    #[arg(long)]
    pub fixture: PathBuf,
    /// Employee id of the viewer
    #[arg(long, default_value_t = 1)]
    pub actor: i64,
    /// Role of the viewer
    #[arg(long, value_enum, default_value_t = RoleArg::Admin)]
    pub role: RoleArg,
    /// Ignore any cached or mirrored copy
    #[arg(long)]
    pub force: bool,
}

impl SourceArgs {
    pub fn actor(&self) -> Actor {
        Actor::new(self.actor, self.role.into())
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleArg {
    Admin,
    Manager,
    Staff,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Admin => Role::Admin,
            RoleArg::Manager => Role::Manager,
            RoleArg::Staff => Role::Staff,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable compact lines
    Pretty,
    /// One JSON object per event
    Json,
}

fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_replay() {
        let args = Args::try_parse_from([
            "stockroom",
            "--tracing",
            "json",
            "replay",
            "--fixture",
            "data.json",
            "--events",
            "events.jsonl",
            "--actor",
            "5",
            "--role",
            "staff",
        ])
        .unwrap();
        assert_eq!(args.tracing, TracingFormat::Json);
        match args.command {
            Command::Replay { source, events } => {
                assert_eq!(source.actor(), Actor::new(5, Role::Staff));
                assert_eq!(events, PathBuf::from("events.jsonl"));
                assert!(!source.force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
