// CLI module for cuebridge
// Author: kelexine (https://github.com/kelexine)

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// cuebridge - caption translation daemon with two-tier caching
#[derive(Parser, Debug)]
#[command(name = "cuebridge", version, about, long_about = None)]
pub struct Args {
    /// Config file (default: ~/.cuebridge/config.toml when present)
    #[arg(long, global = true, env = "CUEBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Runs the daemon when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run the local HTTP daemon
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Translate one capture-adapter track (JSON) and exit
    Translate {
        /// Track file: {videoId, platform, sourceLanguage, cues[], format}
        #[arg(long)]
        input: PathBuf,
        /// Target language (BCP-47)
        #[arg(long)]
        target: String,
        /// Provider id (default: configured default provider)
        #[arg(long)]
        provider: Option<String>,
        /// Write the result here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Manage subscription sessions
    Session {
        #[command(subcommand)]
        action: SessionCommand,
    },

    /// Inspect and maintain the translation cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum SessionCommand {
    /// Import a session file exported by the login helper
    Import {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Check a provider's credentials
    Validate {
        #[arg(long)]
        provider: String,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum CacheCommand {
    /// List durable entries
    List {
        #[arg(long)]
        video_id: Option<String>,
    },
    /// Delete every cached translation of a video
    Purge {
        #[arg(long)]
        video_id: String,
    },
    /// Remove entries older than the configured TTL
    EvictExpired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_means_serve() {
        let args = Args::try_parse_from(["cuebridge"]).unwrap();
        assert!(args.command.is_none());
    }

    #[test]
    fn test_translate_arguments() {
        let args = Args::try_parse_from([
            "cuebridge",
            "translate",
            "--input",
            "track.json",
            "--target",
            "ja",
            "--provider",
            "local",
        ])
        .unwrap();

        assert_eq!(
            args.command,
            Some(Command::Translate {
                input: PathBuf::from("track.json"),
                target: "ja".to_string(),
                provider: Some("local".to_string()),
                output: None,
            })
        );
    }

    #[test]
    fn test_nested_cache_command() {
        let args =
            Args::try_parse_from(["cuebridge", "--config", "c.toml", "cache", "evict-expired"])
                .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("c.toml")));
        assert_eq!(
            args.command,
            Some(Command::Cache {
                action: CacheCommand::EvictExpired
            })
        );

        assert!(Args::try_parse_from(["cuebridge", "cache", "purge"]).is_err());
    }
}
