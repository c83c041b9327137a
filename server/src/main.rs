use clap::Parser;
use log::info;
use std::time::Duration;

use server::config::ServerConfig;
use server::server::GameServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::parse();
    let server = GameServer::new(config).await?;

    tokio::select! {
        result = server.clone().run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            server.stop().await;
            // Give the sender task a moment to flush the kick messages.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    Ok(())
}
