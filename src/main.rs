use anyhow::{Context, Result};
use opsforge::config::OpsConfig;
use opsforge::runtime::OpsRuntime;
use opsforge::server;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,opsforge=debug")),
        )
        .init();

    let config = OpsConfig::load();

    tracing::info!(
        "Starting opsforge (set OPSFORGE_API_TOKEN + optional OPSFORGE_BIND; auth mode via OPSFORGE_AUTH_MODE)"
    );

    let rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    rt.block_on(async {
        let runtime = OpsRuntime::bootstrap(config)
            .await
            .context("failed to bootstrap runtime")?;
        runtime.spawn_background_loops();
        server::serve(&runtime).await
    })
}
