use clap::Parser;
use log::{error, info};
use server::network::{Server, ServerSettings, DEFAULT_IDLE_TIMEOUT, DEFAULT_QUEUE_SIZE};
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, binds the WebSocket listener and serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
        port: u16,
        /// Outbound messages buffered per client before further ones are dropped
        #[clap(short, long, default_value_t = DEFAULT_QUEUE_SIZE)]
        queue_size: usize,
        /// Seconds without any traffic before a client is considered gone
        #[clap(short, long, default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
        idle_timeout: u64,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let settings = ServerSettings {
        queue_size: args.queue_size,
        idle_timeout: Duration::from_secs(args.idle_timeout.max(1)),
    };

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, settings).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
