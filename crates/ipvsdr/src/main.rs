//! Agent entrypoint: load settings, start the backend, run until
//! terminated.

use anyhow::{Context, bail};
use ipvsdr::ipvscache::{IpvsRunner, IpvsadmCmd};
use ipvsdr::provider::Provider;
use ipvsdr::types::StoreLister;
use ipvsdr::{IpvsdrProvider, Settings, StaticStore};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;

    if settings.debug {
        common::logging::init_with_default("debug");
    } else {
        common::logging::init();
    }

    let vip = settings
        .loadbalancer
        .vip
        .parse()
        .context("parsing configured VIP")?;

    let provider = IpvsdrProvider::new(settings.node_ip, vip, settings.unicast)
        .context("building the ipvsdr backend")?;

    let info = provider.info();
    info!(
        name = %info.name,
        version = %info.version,
        commit = %info.git_commit,
        target = %format!("{}/{}", settings.loadbalancer_namespace, settings.loadbalancer_name),
        "starting loadbalancer provider"
    );

    // a fresh boot starts from an empty table; anything left over
    // belongs to a previous incarnation
    if let Err(e) = IpvsadmCmd.clear().await {
        warn!(error = %e, "could not reset the ipvs table");
    }

    let store = Arc::new(StaticStore::new(&settings));
    provider.set_listers(StoreLister {
        nodes: store.clone(),
        ports: store,
    });

    provider.start().await.context("starting the backend")?;

    if !provider.wait_for_start().await {
        error!("keepalived never came up, shutting down");
        if let Err(e) = provider.stop().await {
            warn!(error = %e, "teardown after failed start");
        }
        bail!("backend failed to start");
    }

    if let Err(e) = provider.on_update(&settings.loadbalancer).await {
        error!(error = %e, "initial reconciliation failed");
    }

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        r = tokio::signal::ctrl_c() => {
            r.context("waiting for ctrl-c")?;
            info!("received interrupt");
        }
    }

    provider.stop().await.context("stopping the backend")?;
    Ok(())
}
