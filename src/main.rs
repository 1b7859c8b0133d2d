use anyhow::Error;
use otahub::config::Config;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "otahub=debug,tower_http=info".into()),
        )
        .init();

    // Load the config file
    let config = Config::load()?;
    let bind_addr = config.bind_addr.clone();

    let state = otahub::build_state(config).await?;

    // Start the watchdog, rollout expander and command sweeper
    otahub::spawn_background(&state);

    let app = otahub::api::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("OTA hub listening on http://{bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
