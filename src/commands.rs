//! Command-line interface, parsed with `clap`.
//!
//! ```no_run
//! use clap::Parser;
//! use helpdesk_resolver::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! if let Commands::Ask { question, user } = cli.command {
//!     println!("{user} asks {question}");
//! }
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Config file; defaults to `<config_dir>/config.yaml`.
    #[arg(short, long, global = true, env = "HELPDESK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Resolve one question and print the answer.
    #[clap(name = "ask", alias = "a")]
    Ask {
        question: String,

        /// User id used for rate limiting.
        #[arg(short, long, default_value = "cli")]
        user: String,
    },

    /// Read questions from stdin, one per line, with periodic knowledge refresh.
    #[clap(name = "interactive", alias = "i")]
    Interactive {
        #[arg(short, long, default_value = "cli")]
        user: String,
    },

    /// Rebuild the knowledge index once and print the report.
    Sync,

    /// Write the default config and prompt templates.
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ask() {
        let cli = Cli::parse_from(["helpdesk", "ask", "касса не включается", "-u", "42"]);
        assert_eq!(
            cli.command,
            Commands::Ask {
                question: "касса не включается".to_string(),
                user: "42".to_string()
            }
        );
        assert_eq!(cli.config, None);
    }

    #[test]
    fn test_parse_global_config_and_alias() {
        let cli = Cli::parse_from(["helpdesk", "i", "--config", "/tmp/c.yaml"]);
        assert_eq!(
            cli.command,
            Commands::Interactive {
                user: "cli".to_string()
            }
        );
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
    }
}
