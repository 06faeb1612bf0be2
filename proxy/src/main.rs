use clap::Parser;
use log::{error, info};
use proxy::config::Config;
use proxy::context::ProxyContext;
use proxy::listener::Listener;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = Config::parse();
    let ctx = ProxyContext::init(&config)?;
    let listener = Arc::new(Listener::bind(&config, Arc::clone(&ctx)).await?);

    let mut runner = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.run().await })
    };

    tokio::select! {
        result = &mut runner => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Listener failed: {}", e),
                Err(e) => error!("Listener task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            listener.shutdown().await;
            if let Err(e) = runner.await {
                error!("Listener task panicked: {}", e);
            }
        }
    }

    ctx.provider().close()?;
    info!("Proxy stopped");
    Ok(())
}
