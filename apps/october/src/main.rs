//! # October - Site Server
//!
//! The binary serving October themes over HTTP.
//!
//! This application provides:
//! - HTTP server (axum-based) handing every page request to the engine
//! - CLI interface for routing inspection and cache maintenance
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              apps/october (THE BINARY)          │
//! │                                                 │
//! │    ┌─────────────┐         ┌─────────────┐      │
//! │    │     CLI     │         │  HTTP server│      │
//! │    │   (clap)    │         │   (axum)    │      │
//! │    └──────┬──────┘         └──────┬──────┘      │
//! │           └───────────┬───────────┘             │
//! │                       ▼                         │
//! │              ┌────────────────┐                 │
//! │              │  october-core  │                 │
//! │              │  (THE ENGINE)  │                 │
//! │              └────────────────┘                 │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Serve the active theme
//! october serve --host 0.0.0.0 --port 8080
//!
//! # Inspect routing
//! october routes
//! october resolve /blog/hello-world
//! ```

use clap::Parser;
use october::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // OCTOBER_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("OCTOBER_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "october=info,october_core=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        r#"
   ___       _        _
  / _ \  ___| |_ ___ | |__   ___ _ __
 | | | |/ __| __/ _ \| '_ \ / _ \ '__|
 | |_| | (__| || (_) | |_) |  __/ |
  \___/ \___|\__\___/|_.__/ \___|_|

  Site Server v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
