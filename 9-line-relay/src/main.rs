use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use line_relay::{
    cli::{Cli, Command},
    client,
    relay::Relay,
};

fn init_tracing() {
    use std::io::IsTerminal;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let relay = Relay::bind(args.to_config())
                .await
                .context("relay failed to start")?;
            let addr = relay.local_addr()?;
            info!("relay listening on {}", addr);
            relay.run_until_ctrl_c().await;
        }
        Command::Connect(args) => client::run(args).await?,
    }

    Ok(())
}
