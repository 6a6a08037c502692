use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use taxflow_core::scheduler::Scheduler;

pub fn run(path: &Path, port: Option<u16>) -> anyhow::Result<()> {
    let config = super::load_config(path)?;
    let scheduler = Arc::new(
        Scheduler::from_config(&config, path).context("failed to start scheduler")?,
    );
    scheduler.recover().context("startup recovery failed")?;

    let port = port.or(config.server.port);
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        if let Some(port) = port {
            let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
                .await
                .with_context(|| format!("failed to bind status API on port {port}"))?;
            let api = scheduler.clone();
            tokio::spawn(async move {
                if let Err(e) = taxflow_server::serve_on(api, listener).await {
                    tracing::error!(error = %e, "status API stopped");
                }
            });
        }

        scheduler
            .run_forever(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            })
            .await;
        Ok::<_, anyhow::Error>(())
    })
}
