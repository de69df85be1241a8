use clap::Parser;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use wspipe::config::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!(
        "starting wspipe v{} port: {} role: {} ws url: {:?}",
        env!("CARGO_PKG_VERSION"),
        args.port,
        args.role,
        args.ws_url
    );

    wspipe::run(args).await
}
