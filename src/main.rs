//! GPU usage bot entry point.

#[tokio::main]
async fn main() {
    // Initialise tracing (respects RUST_LOG env, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenv::dotenv().ok();

    if let Err(e) = gpu_usage_bot::run().await {
        tracing::error!(error = %e, "bot stopped");
        std::process::exit(1);
    }
}
