use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tunl::{ClientConfig, ConnectionManager};

/// Expose a local HTTP server through a public subdomain.
#[derive(Parser, Debug)]
#[command(name = "tunl")]
#[command(version)]
#[command(about = "Expose a local HTTP server through a public subdomain")]
struct Cli {
    /// Local port to expose
    #[arg(value_parser = clap::value_parser!(u16).range(1024..=65535))]
    port: u16,

    /// Subdomain to request (random when omitted)
    subdomain: Option<String>,

    /// API key for registered accounts
    #[arg(short = 'k', long = "api-key", env = "TUNL_API_KEY")]
    api_key: Option<String>,

    /// Tunnel server endpoint
    #[arg(long, env = "TUNNEL_SERVER", default_value = "wss://tunl.cc")]
    server: String,

    /// Give up after this many failed reconnect attempts (unlimited when omitted)
    #[arg(long, env = "TUNL_MAX_RECONNECTS")]
    max_reconnects: Option<u32>,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tunl=info".parse().expect("static directive")),
        )
        .with_target(false)
        .init();

    tracing::info!("forwarding {} -> 127.0.0.1:{}", cli.server, cli.port);

    let mut config = ClientConfig::new(cli.server, cli.port);
    config.subdomain = cli.subdomain;
    config.api_key = cli.api_key;
    config.max_reconnects = cli.max_reconnects;

    let manager = ConnectionManager::new(config);

    tokio::select! {
        result = manager.run() => {
            if let Err(e) = result {
                tracing::error!("{e:#}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
}
