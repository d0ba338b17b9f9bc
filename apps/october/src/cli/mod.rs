//! # October CLI Module
//!
//! ## Available Commands
//!
//! - `serve` - Start the HTTP server
//! - `resolve` - Show which page a URL routes to
//! - `routes` - List the active theme's routes in match order
//! - `bake-routes` - Write the route manifest for the active theme
//! - `clear-cache` - Drop route, object and template caches

mod commands;

use clap::{Parser, Subcommand};
use october_core::CmsError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// October - serves October themes.
#[derive(Parser, Debug)]
#[command(name = "october")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the configuration file
    #[arg(short = 'c', long, global = true, default_value = "october.toml")]
    pub config: PathBuf,

    /// Override the active theme
    #[arg(short = 't', long, global = true)]
    pub theme: Option<String>,

    /// Output in JSON format (for programmatic access)
    #[arg(long = "json", global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },

    /// Show which page a URL routes to
    Resolve {
        /// Request URL, e.g. /blog/hello
        url: String,
    },

    /// List routes in match order
    Routes,

    /// Bake the route table into a manifest file
    BakeRoutes,

    /// Clear route, object and template caches
    ClearCache,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), CmsError> {
    let config = load_config(&cli.config, cli.theme.as_deref())?;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Serve { host, port }) => cmd_serve(config, &host, port).await,
        Some(Commands::Resolve { url }) => cmd_resolve(config, &url, json_mode),
        Some(Commands::Routes) | None => cmd_routes(config, json_mode),
        Some(Commands::BakeRoutes) => cmd_bake_routes(config),
        Some(Commands::ClearCache) => cmd_clear_cache(config),
    }
}
