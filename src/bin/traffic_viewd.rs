//! traffic_viewd - live traffic CCTV view service
//!
//! This daemon:
//! 1. Loads configuration (file named by TRAFFIC_VIEW_CONFIG, then env)
//! 2. Builds the shared resolver, detector, ROI registry and forwarder
//! 3. Serves MJPEG / WebSocket views and the ROI API until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::sync::Arc;

use traffic_view::api::ApiServer;
use traffic_view::config::ServiceConfig;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServiceConfig::load()?;
    let ctx = config.build_context()?;
    log::info!(
        "engine={} target_fps={} auto_roi={} roi_store={:?} ({})",
        ctx.adapter.engine_name(),
        config.pipeline.target_fps,
        config.pipeline.auto_roi,
        config.roi.store,
        config.roi.path.display()
    );
    if config.downstream.enabled {
        log::info!("forwarding detections to {}", config.downstream.base_url);
    } else {
        log::info!("detection forwarding disabled");
    }

    let api_handle = ApiServer::new(config.api_config(), Arc::new(ctx)).spawn()?;
    log::info!(
        "traffic_viewd {} running on {}",
        env!("CARGO_PKG_VERSION"),
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, closing sessions...");
    api_handle.stop()?;
    Ok(())
}
