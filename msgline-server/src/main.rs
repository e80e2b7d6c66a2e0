// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::Result;
use clap::Parser;
use msgline_server::{config::ServerConfig, run_server};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, env = "MSGLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Worker lane count (overrides config file)
    #[arg(long)]
    lanes: Option<usize>,

    /// Retained history in seconds (overrides config file)
    #[arg(long)]
    remain_secs: Option<i64>,

    /// Disable the retention sweep
    #[arg(long)]
    no_retention: bool,

    /// OTLP collector endpoint
    #[arg(long)]
    otlp_endpoint: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = ServerConfig::load(args.config)?;

    // Apply CLI overrides
    if let Some(lanes) = args.lanes {
        config.ingest.lanes = lanes;
    }
    if let Some(remain_secs) = args.remain_secs {
        config.retention.remain_secs = remain_secs;
    }
    if args.no_retention {
        config.retention.enabled = false;
    }
    if let Some(endpoint) = args.otlp_endpoint {
        config.telemetry.otlp_endpoint = Some(endpoint);
    }
    if args.json_logs {
        config.telemetry.json_logs = true;
    }

    run_server(config).await
}
