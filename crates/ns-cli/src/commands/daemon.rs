use ns_core::config::Config;
use ns_daemon::Runtime;
use tracing::info;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let runtime = Runtime::build(config).await?;
    let daemon = runtime.daemon();

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            shutdown.trigger();
        }
    });

    daemon.run(&runtime.store).await?;
    info!("daemon stopped");
    Ok(())
}
