//! Command-line interface definition for Cryostat
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for target discovery and rule management.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Cryostat - JVM target discovery and capture automation
///
/// Discovers JVM targets across the configured platforms and manages the
/// automation rules applied to them.
#[derive(Parser, Debug, Clone)]
#[command(name = "cryostat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/cryostat.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Directory holding persisted rules
    #[arg(long)]
    pub rules_dir: Option<PathBuf>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print every discoverable target as JSON
    Discover,

    /// Print the merged discovery tree as JSON
    Tree,

    /// Manage automation rules
    Rules {
        /// Rule subcommand
        #[command(subcommand)]
        command: RuleCommand,
    },
}

/// Rule management subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum RuleCommand {
    /// Check a match expression without storing anything
    Validate {
        /// Match expression text
        expression: String,
    },

    /// List stored rules as JSON
    List,

    /// Store a new rule
    Add(AddRuleArgs),

    /// Delete a rule
    Delete {
        /// Rule name
        name: String,
    },

    /// Enable a rule
    Enable {
        /// Rule name
        name: String,
    },

    /// Disable a rule
    Disable {
        /// Rule name
        name: String,
    },
}

/// Fields of a new rule
#[derive(Args, Debug, Clone)]
pub struct AddRuleArgs {
    /// Rule name; whitespace becomes underscores
    #[arg(long)]
    pub name: String,

    /// Free-form description
    #[arg(long, default_value = "")]
    pub description: String,

    /// Match expression selecting targets
    #[arg(long = "match")]
    pub match_expression: String,

    /// `archive` or `template=<name>[,type=<TARGET|CUSTOM>]`
    #[arg(long = "event")]
    pub event_specifier: String,

    /// Seconds between periodic archives
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub archival_period: i64,

    /// Seconds before the first archive
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub initial_delay: i64,

    /// Archives kept per target
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub preserved_archives: i64,

    /// Maximum age of capture data on the target, in seconds
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub max_age: i64,

    /// Maximum size of capture data on the target, in bytes
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub max_size: i64,

    /// Store the rule disabled
    #[arg(long)]
    pub disabled: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_discover() {
        let cli = Cli::try_parse_from(["cryostat", "discover"]).unwrap();
        assert!(matches!(cli.command, Commands::Discover));
        assert_eq!(cli.config.as_deref(), Some("config/cryostat.yaml"));
        assert!(!cli.verbose);
    }

    #[test]
    fn test_parse_rules_add() {
        let cli = Cli::try_parse_from([
            "cryostat",
            "--rules-dir",
            "/tmp/rules",
            "rules",
            "add",
            "--name",
            "my rule",
            "--match",
            "target.alias == 'x'",
            "--event",
            "template=Continuous",
            "--archival-period",
            "60",
            "--preserved-archives",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.rules_dir, Some(PathBuf::from("/tmp/rules")));
        match cli.command {
            Commands::Rules {
                command: RuleCommand::Add(args),
            } => {
                assert_eq!(args.name, "my rule");
                assert_eq!(args.match_expression, "target.alias == 'x'");
                assert_eq!(args.archival_period, 60);
                assert_eq!(args.preserved_archives, 3);
                assert!(!args.disabled);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_rules_validate() {
        let cli = Cli::try_parse_from(["cryostat", "-v", "rules", "validate", "true"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Rules {
                command: RuleCommand::Validate { .. }
            }
        ));
    }

    #[test]
    fn test_rules_requires_subcommand() {
        assert!(Cli::try_parse_from(["cryostat", "rules"]).is_err());
    }
}
