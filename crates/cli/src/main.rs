use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod vision;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lumen=info,lumen_comfyui=info,lumen_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = cli::Cli::parse();
    cli::execute(args).await
}
