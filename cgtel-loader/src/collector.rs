//! Periodic snapshot-and-clear loop: attach once, then drain every
//! aggregation map on a fixed interval until shutdown.

use std::time::Duration;

use log::{debug, info, warn};

use crate::config::Config;
use crate::snapshot::ProbeHandle;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let mut handle = ProbeHandle::open(config.bpf_object_path())?;
    handle.load()?;
    handle.populate_tracked_syscalls(&config.tracked_syscalls)?;
    handle.attach_all(config.enable_optional_probes)?;
    info!(
        "[cgtel-loader] probes attached, polling every {}ms",
        config.poll_interval_ms
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match handle.drain_all(config.drain_batch_size) {
                    Ok(snapshot) => debug!(
                        "[cgtel-loader] drained snapshot: {} cgroups, {} syscall aggregates",
                        snapshot.cgroups.len(),
                        snapshot.syscalls.len(),
                    ),
                    Err(err) => warn!("[cgtel-loader] snapshot drain failed: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("[cgtel-loader] shutdown signal received");
                break;
            }
        }
    }

    handle.destroy();
    Ok(())
}
