use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::ai::DEFAULT_MODEL;

#[derive(Parser, Debug)]
#[command(name = "feedbackas")]
#[command(about = "Peer feedback service - request, give and summarise feedback")]
#[command(version)]
pub struct Cli {
    /// Path to the SQLite database (defaults to the platform data dir)
    #[arg(long, global = true, env = "FEEDBACKAS_DB")]
    pub db: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error (RUST_LOG takes precedence)
    #[arg(long, global = true, env = "FEEDBACKAS_LOG", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the database
    Init,

    /// Run the HTTP server
    Serve(ServeArgs),

    /// Create a superuser account
    Createsuperuser {
        username: String,

        email: String,

        /// Password for the new account
        #[arg(short, long, env = "FEEDBACKAS_SUPERUSER_PASSWORD")]
        password: String,
    },

    /// Show feedback statistics for a user
    Stats {
        username: String,
    },

    /// Fill the database with demo data
    Seed {
        /// Number of users to create
        #[arg(short, long, default_value = "20")]
        users: usize,

        /// Company the users belong to
        #[arg(short, long, default_value = "Demo Company")]
        company: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "FEEDBACKAS_ADDR", default_value = "127.0.0.1:8000")]
    pub addr: SocketAddr,

    /// Text generation model (gemini-1.5-flash, gemini-1.5-pro, api-sonnet, gpt-4o, ...)
    #[arg(short, long, env = "FEEDBACKAS_AI_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,
}

fn level_filter(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Filter directives used when RUST_LOG is not set.
pub fn default_filter(level: &str) -> String {
    let level = level_filter(level);
    format!("feedbackas={},tower_http={}", level, level)
}

pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter("DEBUG"), "feedbackas=debug,tower_http=debug");
        assert_eq!(default_filter("loud"), "feedbackas=info,tower_http=info");
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["feedbackas", "serve"]).unwrap();
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.addr.port(), 8000);
                assert_eq!(args.model, DEFAULT_MODEL);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_db_flag() {
        let cli = Cli::try_parse_from(["feedbackas", "stats", "ana", "--db", "/tmp/f.db"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/f.db")));
        assert!(matches!(cli.command, Commands::Stats { ref username } if username == "ana"));
    }
}
