//! Pylon communicator binary.
//!
//! # Usage
//!
//! ```bash
//! # Start a communicator with one adapter bound to the given address
//! pylon-runtime --bind 0.0.0.0:9090
//!
//! # Layer a toml property file underneath CLI overrides
//! pylon-runtime --bind 0.0.0.0:9090 --properties pylon.toml
//! ```

use clap::Parser;
use pylon_runtime::{Communicator, MapProperties};

/// Pylon communicator runtime
#[derive(Parser, Debug)]
#[command(name = "pylon-runtime")]
#[command(about = "Pylon communicator runtime")]
#[command(version)]
struct Args {
    /// Address the default object adapter listens on
    #[arg(short, long, default_value = "0.0.0.0:9090")]
    bind: String,

    /// Path to a toml property file, layered underneath CLI overrides
    #[arg(long)]
    properties: Option<String>,

    /// Maximum accepted message size, in kB
    #[arg(long)]
    message_size_max: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    pylon_runtime::logger::init_tracing(&args.log_level);

    let mut properties = match &args.properties {
        Some(path) => MapProperties::from_toml_file(path)?,
        None => MapProperties::new(),
    };
    if let Some(kb) = &args.message_size_max {
        properties.set("MessageSizeMax", kb.clone());
    }

    tracing::info!(bind = %args.bind, "pylon communicator starting");

    let communicator = Communicator::new(Box::new(properties));
    communicator.create_object_adapter("Default", args.bind.parse()?).await?;
    communicator.activate().await?;

    tracing::info!("communicator active, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    communicator.destroy().await;

    Ok(())
}
