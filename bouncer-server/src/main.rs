use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("bouncer_server=info".parse()?),
        )
        .init();

    let config = bouncer_server::config::ServerConfig::parse();
    tracing::info!("Starting bouncer on {}", config.listen_addr);

    let server = bouncer_server::server::Server::open(config)?;
    server.run().await
}
