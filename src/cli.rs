//! Command-line argument parsing for the copilot server.

use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;
use crate::logging::default_log_path;

/// Natural-language query service for connected databases.
#[derive(Parser, Debug)]
#[command(name = "db-copilot")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Address to bind the HTTP server to
    #[arg(long, value_name = "HOST", env = "COPILOT_HOST")]
    pub host: Option<String>,

    /// Port to bind the HTTP server to
    #[arg(short = 'p', long, value_name = "PORT", env = "COPILOT_PORT")]
    pub port: Option<u16>,

    /// Config file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// LLM provider (openai, ollama, mock, none); overrides the config file
    #[arg(long, value_name = "PROVIDER")]
    pub llm: Option<String>,

    /// Serve every configured connection id from an in-memory mock database
    #[arg(long)]
    pub mock_db: bool,

    /// Write logs to a file instead of stderr (default path when none given)
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Applies CLI overrides on top of a loaded config.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(llm) = &self.llm {
            config.llm.provider = llm.clone();
        }
        if let Some(log_file) = &self.log_file {
            config.logging.file = Some(log_file.clone().unwrap_or_else(default_log_path));
        }
    }
}
