// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use xboard_panel::config::{Cli, PanelConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_format, &cli.log_level);

    let config = match PanelConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("config: {e:#}");
            std::process::exit(2);
        }
    };

    if let Err(e) = xboard_panel::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(format: &str, level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_owned()));
    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
