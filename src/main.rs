use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

use modbus_rtu_gateway::{
    Config, ModbusCache, RequestQueue, RtuContext, RtuWorker, Task, TcpRtuBridge, Transport,
};

type Worker = RtuWorker<RtuContext>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(ChronoUtc::rfc_3339())
        .init();

    let config = Config::parse();
    info!(port = %config.serial_port, baud_rate = config.baud_rate, "starting modbus RTU gateway");

    let mut rtu = RtuContext::new(config.serial_settings(), config.reconnect_policy());
    if let Err(e) = rtu.reconnect_rtu(Task::InitialConnect).await {
        warn!(error = %e, "serial line not available yet, will retry on demand");
    }

    let queue = RequestQueue::new();
    let cache = ModbusCache::new(config.cache_max_age)
        .with_error_retention(config.error_retention)
        .shared();
    let worker = Arc::new(RtuWorker::new(queue.clone(), rtu, cache));

    let mut join_set = JoinSet::new();
    start_worker_task(&mut join_set, worker.clone());
    start_cleanup_task(&mut join_set, worker.clone(), &config);

    let mut bridge = TcpRtuBridge::new(queue);
    if let Some(addr) = config.bridge_addr() {
        bridge
            .start_server(addr)
            .await
            .with_context(|| format!("cannot start TCP bridge on {addr}"))?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        Some(res) = join_set.join_next() => error!(?res, "task finished unexpectedly"),
    }

    bridge.stop_server().await;
    join_set.shutdown().await;
    Ok(())
}

fn start_worker_task(join_set: &mut JoinSet<()>, worker: Arc<Worker>) {
    join_set.spawn(async move {
        worker.serve().await;
    });
}

fn start_cleanup_task(join_set: &mut JoinSet<()>, worker: Arc<Worker>, config: &Config) {
    let mut interval = time::interval(config.cache_cleanup_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    join_set.spawn(async move {
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            worker.cleanup_cache();

            for slave_id in worker.slave_ids() {
                match serde_json::to_string(&worker.status(slave_id)) {
                    Ok(status) => info!(slave = slave_id, %status, "slave status"),
                    Err(e) => warn!(slave = slave_id, error = %e, "cannot render slave status"),
                }
            }
        }
    });
}
