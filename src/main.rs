use std::path::PathBuf;

use clap::{CommandFactory as _, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(name = "httplock", about = "HTTP proxy for enabling reproducible builds")]
struct Cli {
    /// Config file (JSON).
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off).
    #[arg(short = 'v', long, global = true)]
    verbosity: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy and API servers.
    Server {
        /// API listener address.
        #[arg(long = "addr-api")]
        addr_api: Option<String>,

        /// Proxy listener address.
        #[arg(long = "addr-proxy")]
        addr_proxy: Option<String>,
    },
    /// Print the version.
    Version,
    /// Generate shell completions.
    Completion { shell: Shell },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Server {
            addr_api,
            addr_proxy,
        } => {
            httplock::logging::init(cli.verbosity.as_deref())?;
            let config = httplock::config::Config::load(
                cli.config.as_deref(),
                addr_api.as_deref(),
                addr_proxy.as_deref(),
            )?;
            let server = httplock::server::serve(config).await?;
            tracing::info!(
                proxy = %server.proxy_addr,
                api = %server.api_addr,
                "httplock started"
            );

            wait_for_shutdown_signal().await?;
            tracing::info!("shutting down");
            server.shutdown().await;
        }
        Command::Version => {
            println!("httplock {}", env!("CARGO_PKG_VERSION"));
        }
        Command::Completion { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "httplock", &mut std::io::stdout());
        }
    }

    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
