use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tabmux_worker::config::{LogFormat, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "tabmux-worker", about = "Shared process serving tab ports")]
struct Args {
    /// Address to listen on. Overrides `TABMUX_BIND_ADDR`.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Directory for persisted state. Overrides `TABMUX_DATA_DIR`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = WorkerConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.set_bind_addr(bind);
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }

    init_tracing(config.log_format);
    tabmux_worker::serve(config).await
}
