//! provmond: the provision monitor daemon.
//!
//! # Usage
//!
//! ```text
//! provmond run --config /etc/provmon/provmon.toml --port 9010
//! provmond check-config --config /etc/provmon/provmon.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use provmon_core::MonitorConfig;

const DEFAULT_FILTER: &str = "info,provmond=debug,provmon=debug";

#[derive(Parser)]
#[command(name = "provmond", about = "Provision monitor daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor.
    Run {
        /// Path to provmon.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// API port, overriding the config file.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory, overriding the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Advertised host, overriding the config file.
        #[arg(long)]
        host: Option<String>,

        /// Monitor name, overriding the config file.
        #[arg(long)]
        name: Option<String>,
    },

    /// Parse and validate a config file, then print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            host,
            name,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(port) = port {
                cfg.monitor.api_port = port;
            }
            if let Some(data_dir) = data_dir {
                cfg.monitor.data_dir = data_dir;
            }
            if let Some(host) = host {
                cfg.monitor.host = host;
            }
            if let Some(name) = name {
                cfg.monitor.name = name;
            }
            provmond::run(cfg).await
        }
        Command::CheckConfig { config } => {
            let cfg = load_config(Some(&config))?;
            cfg.validate()?;
            print!("{}", cfg.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<MonitorConfig> {
    match path {
        Some(path) => MonitorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(MonitorConfig::default()),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
