use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use heatplant::{DaemonConfig, Event, JsonFileStore, Plant, PlantConfig, RestHost, ZoneEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> heatplant::Result<()> {
    tracing_subscriber::fmt::init();

    let daemon = DaemonConfig::from_env()?;
    let config = PlantConfig::from_file(&daemon.config_path)?;
    info!(path = %daemon.config_path.display(), zones = config.zones.len(), "configuration loaded");

    let mut builder = RestHost::builder(&daemon.base_url);
    if let Some(token) = &daemon.token {
        builder = builder.token(token);
    }
    let host = Arc::new(builder.build()?);

    host.refresh().await?;
    match host.refresh_services().await {
        Ok(count) => info!(services = count, "service registry loaded"),
        Err(e) => warn!(error = %e, "could not load service registry; assuming all services exist"),
    }

    let store = JsonFileStore::new(&daemon.storage_path);
    let mut plant = Plant::new(config, host.clone(), store)?;

    let mut events = plant.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::Zone { event: ZoneEvent::Updated, .. }) => {}
                Ok(Event::Zone { zone_id, event }) => info!(zone = %zone_id, ?event, "zone event"),
                Ok(event) => info!(?event, "plant event"),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    plant.start(Utc::now()).await;

    loop {
        let now = Utc::now();
        let sleep = plant
            .next_wakeup()
            .await
            .and_then(|at| (at - now).to_std().ok())
            .map_or(daemon.poll_interval, |until| until.min(daemon.poll_interval));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            _ = tokio::time::sleep(sleep.max(Duration::from_millis(100))) => {}
        }

        match host.refresh().await {
            Ok(changed) => plant.handle_state_changes(&changed, Utc::now()).await,
            Err(e) if e.is_retryable() => warn!(error = %e, "state refresh failed; retrying"),
            Err(e) => error!(error = %e, "state refresh failed"),
        }
        plant.tick(Utc::now()).await;
    }

    plant.shutdown().await;
    Ok(())
}
