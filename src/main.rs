use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use payment_admission::comms::local_api;
use payment_admission::config::Config;
use payment_admission::utils;

#[derive(Parser)]
#[command(name = "payment-admission", version, about = "Credential resolution and idempotency gate")]
struct AppCli {
    /// Config file path (environment variables override its values)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start HTTP server
    Serve {
        #[arg(long, env = "PORT", default_value_t = 8080)]
        port: u16,
    },
    /// Validate configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let config = Config::load(&args.config)?;

    match args.command {
        Some(Commands::CheckConfig) => {
            info!(
                strict_session_mode = config.strict_session_mode(),
                api_keys = config.api_keys.len(),
                redis = config.redis_url.is_some(),
                "configuration ok"
            );
        }
        Some(Commands::Serve { port }) => {
            info!(version = payment_admission::VERSION, "starting admission server on port {port}");
            local_api::serve(config, port).await?;
        }
        None => {
            local_api::serve(config, 8080).await?;
        }
    }

    Ok(())
}
