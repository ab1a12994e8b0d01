//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Card wall query engine
///
/// Compiles MQL against a project configuration, validates project
/// configurations and describes saved view filters.
///
/// Exit Codes:
///   0  - Command succeeded
///   1  - Generic error occurred
///   2  - Invalid arguments, MQL syntax or query
///   3  - Resource not found (config file, tree, property)
///   4  - Project configuration failed validation
///  10  - File system failure
#[derive(Parser)]
#[command(name = "cardwall")]
#[command(about = "MQL card query engine", long_about = None)]
pub struct Cli {
    /// Project configuration file
    #[arg(short, long, global = true, default_value = crate::config::CONFIG_FILE)]
    pub config: PathBuf,

    /// Output JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output (for scripting)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile an MQL query and print its SQL forms
    ///
    /// Prints the canonical MQL followed by the values, card id, count and
    /// card number SQL the query compiles to.
    Compile {
        /// MQL query, e.g. "SELECT Name, Points WHERE Type = Story"
        mql: String,

        /// Login that CURRENT USER resolves to
        #[arg(long)]
        user: Option<String>,

        /// Date TODAY resolves to (YYYY-MM-DD, default: today)
        #[arg(long)]
        today: Option<String>,
    },

    /// Validate the project configuration
    ///
    /// Checks card types, properties, tree structure, aggregate targets,
    /// formula dependency cycles and saved view filters, reporting every
    /// problem found.
    Validate,

    /// Describe view filters and the MQL they select
    DescribeFilter {
        /// Filters as [Property][operator][value]
        filters: Vec<String>,

        /// Tree the level filters apply to
        #[arg(long)]
        tree: Option<String>,

        /// Tree level filter as "<Card Type>=[Property][operator][value]" (repeatable)
        #[arg(long = "level", requires = "tree")]
        levels: Vec<String>,

        /// Card type to hide from the tree (repeatable)
        #[arg(long, requires = "tree")]
        exclude: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_describe_filter_levels() {
        let cli = Cli::try_parse_from([
            "cardwall",
            "describe-filter",
            "--tree",
            "Planning",
            "--level",
            "Story=[Status][is][open]",
            "--exclude",
            "Release",
        ])
        .unwrap();
        match cli.command {
            Commands::DescribeFilter {
                filters,
                tree,
                levels,
                exclude,
            } => {
                assert!(filters.is_empty());
                assert_eq!(tree.as_deref(), Some("Planning"));
                assert_eq!(levels, vec!["Story=[Status][is][open]"]);
                assert_eq!(exclude, vec!["Release"]);
            }
            _ => panic!("expected describe-filter"),
        }
        assert_eq!(cli.config, PathBuf::from("cardwall.toml"));
    }

    #[test]
    fn test_level_requires_tree() {
        assert!(Cli::try_parse_from([
            "cardwall",
            "describe-filter",
            "--level",
            "Story=[Status][is][open]"
        ])
        .is_err());
    }
}
