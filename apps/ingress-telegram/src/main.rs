use anyhow::Result;
use relay_ingress_telegram::{StopCause, load_config, run};
use relay_telemetry::{TelemetryConfig, init_telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = TelemetryConfig::from_env("relay-ingress-telegram", env!("CARGO_PKG_VERSION"));
    init_telemetry(telemetry)?;

    let config_path = std::env::var("RELAY_CONFIG").ok();
    let config = load_config(config_path.as_deref())?;
    let summary = run(&config).await?;
    tracing::info!(
        cause = ?summary.stop_cause,
        delivered = summary.publish.delivered,
        duplicates = summary.publish.duplicates,
        failed = summary.publish.failed,
        "relay exited"
    );
    if summary.stop_cause == StopCause::StreamFailed {
        anyhow::bail!("telegram update stream failed");
    }
    Ok(())
}
