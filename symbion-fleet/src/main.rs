/**
 * SYMBION FLEET - Point d'entrée du plan de contrôle
 *
 * RÔLE : charge la config, ouvre les tables JSON, connecte le broker MQTT,
 * construit le kernel et démarre les boucles de fond (cron, sonde de
 * joignabilité, flush des heartbeats, publication du health).
 *
 * ARRÊT : Ctrl-C ou erreur fatale de la boucle cron. Les heartbeats sont
 * écrits une dernière fois avant de quitter.
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use symbion_fleet::config::load_config;
use symbion_fleet::health::spawn_health_publisher;
use symbion_fleet::mqtt::{create_mqtt_client, spawn_mqtt_listener};
use symbion_fleet::reachability::ReachabilityTracker;
use symbion_fleet::transport::mqtt::MqttTransport;
use symbion_fleet::{FleetKernel, FleetStores, KernelOptions};
use tokio::sync::watch;
use tracing::{error, info};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "symbion_fleet=info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = load_config().await.context("Failed to load fleet config")?;
    info!(data_dir = ?cfg.data_dir, broker = %cfg.mqtt.host, "starting symbion fleet");

    let stores = FleetStores::open(&cfg.data_dir).context("Failed to open data tables")?;
    let reachability = Arc::new(
        ReachabilityTracker::with_data_file(cfg.data_dir.join("heartbeats.json"))
            .context("Failed to load heartbeats")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (client, eventloop) = create_mqtt_client(&cfg.mqtt);
    let transport = MqttTransport::new(client.clone());

    let kernel = Arc::new(
        FleetKernel::build(
            stores,
            Arc::new(transport.clone()),
            reachability.clone(),
            KernelOptions::from_config(&cfg),
        )
        .context("Failed to build fleet kernel")?,
    );

    let mut background = vec![spawn_mqtt_listener(
        client.clone(),
        eventloop,
        transport,
        kernel.health_tracker().clone(),
        shutdown_rx.clone(),
    )];

    background.push(ReachabilityTracker::spawn_flush_loop(
        reachability.clone(),
        Duration::from_secs(cfg.reachability.flush_interval_secs.max(1)),
        shutdown_rx.clone(),
    ));

    if cfg.reachability.probe_interval_secs > 0 {
        background.push(FleetKernel::spawn_probe_loop(
            kernel.clone(),
            Duration::from_secs(cfg.reachability.probe_interval_secs),
            shutdown_rx.clone(),
        ));
    }

    if cfg.health.publish_interval_secs > 0 {
        let k = kernel.clone();
        background.push(spawn_health_publisher(
            client.clone(),
            Duration::from_secs(cfg.health.publish_interval_secs),
            move || k.health(),
            shutdown_rx.clone(),
        ));
    }

    let mut cron = cfg
        .scheduler
        .enabled
        .then(|| kernel.engine().clone().spawn_cron_loop(shutdown_rx.clone()));

    let (outcome, cron_done): (Result<()>, bool) = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            (res.context("Failed to listen for ctrl-c"), false)
        }
        joined = async {
            match cron.as_mut() {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => {
            let outcome = match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "fatal scheduler error");
                    Err(e.into())
                }
                Err(e) => Err(anyhow::anyhow!("cron loop panicked: {e}")),
            };
            (outcome, true)
        }
    };

    let _ = shutdown_tx.send(true);
    if let (Some(handle), false) = (cron, cron_done) {
        let _ = handle.await;
    }
    for handle in background {
        let _ = handle.await;
    }
    info!("symbion fleet stopped");
    outcome
}
