use std::time::Duration;

use ndt7_server::{ReceiverConfig, Server};
use tokio_util::sync::CancellationToken;

#[derive(clap::Parser)]
#[command(name = "ndt7-server")]
#[command(about = "Accept ndt7 clients and log their counter-flow measurements")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,
    /// Receiver lifetime bound, in seconds
    #[arg(long, default_value_t = ndt7_proto::MAX_RUNTIME.as_secs())]
    max_runtime_secs: u64,
    /// Largest accepted client frame, in bytes
    #[arg(long, default_value_t = ndt7_proto::MAX_MESSAGE_SIZE)]
    max_message_size: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli: Cli = clap::Parser::parse();
    let config = ReceiverConfig::new(
        Duration::from_secs(cli.max_runtime_secs),
        cli.max_message_size,
    );

    let shutdown = CancellationToken::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let server = Server::bind(&cli.listen, config, shutdown).await?;
    server.run().await?;
    Ok(())
}
