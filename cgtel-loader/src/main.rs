mod collector;
mod config;
mod error;
mod snapshot;

use anyhow::Context;
use caps::{CapSet, Capability};
use config::Config;
use log::info;

fn ensure_capabilities() -> anyhow::Result<()> {
    let required = [
        Capability::CAP_BPF,
        Capability::CAP_PERFMON,
        Capability::CAP_SYS_ADMIN,
    ];
    for cap in required {
        let has_cap = caps::has_cap(None, CapSet::Effective, cap)
            .with_context(|| format!("failed to query capability {cap:?}"))?;
        if !has_cap {
            anyhow::bail!(
                "missing {cap:?} capability. Grant it with \
                 `sudo setcap cap_bpf,cap_perfmon,cap_sys_admin+ep $(command -v cgtel-loader)` \
                 and restart."
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    if let Some(path) = std::env::args().nth(1) {
        std::env::set_var("CGTEL_CONFIG", path);
    }
    let config = Config::load();

    ensure_capabilities()?;

    info!(
        "[cgtel-loader] starting with bpf object {}",
        config.bpf_object_path
    );

    collector::run(config).await.context("collector loop failed")
}
