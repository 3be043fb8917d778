//! CLI module - command-line argument parsing
//!
//! The gateway takes a bind port and the path to its `models.json`; the log
//! level is a convenience default that `RUST_LOG` overrides.

use std::path::PathBuf;

use clap::Parser;

/// omnigate - OpenAI-compatible gateway for heterogeneous LLM backends
#[derive(Parser, Debug)]
#[command(name = "omnigate")]
#[command(version)]
#[command(about = "OpenAI-compatible gateway for heterogeneous LLM backends", long_about = None)]
pub struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8765)]
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Path to the models.json configuration file
    #[arg(long, default_value = "models.json")]
    pub config: PathBuf,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
