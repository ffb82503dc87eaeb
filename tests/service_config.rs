use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use traffic_view::config::{EngineBackend, RoiStoreKind, ServiceConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "TRAFFIC_VIEW_CONFIG",
        "TRAFFIC_VIEW_ADDR",
        "BACKEND_BASE",
        "TRAFFIC_VIEW_TARGET_FPS",
        "MODEL_PATH",
        "MODEL_URL",
        "YOLO_CLASSES",
        "CONF_THRES",
        "IOU_THRES",
        "ROI_STORE_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "server": { "addr": "0.0.0.0:9000" },
        "upstream": { "base_url": "http://metadata:3001/", "timeout_ms": 1500, "backoff_secs": 45 },
        "downstream": { "enabled": true, "queue_capacity": 8 },
        "roi": { "store": "memory" },
        "pipeline": { "target_fps": 12, "auto_roi": false },
        "engine": { "backend": "scripted", "labels": ["car", "bus"], "confidence": 0.3 },
        "congestion": { "alpha": 4.0, "weights": { "bus": 2.5 } }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("TRAFFIC_VIEW_CONFIG", file.path());
    std::env::set_var("BACKEND_BASE", "http://collector:4000");
    std::env::set_var("TRAFFIC_VIEW_TARGET_FPS", "5");
    std::env::set_var("YOLO_CLASSES", "bus, truck ,");
    std::env::set_var("IOU_THRES", "0.6");

    let cfg = ServiceConfig::load().expect("load config");

    assert_eq!(cfg.server.addr, "0.0.0.0:9000");
    assert_eq!(cfg.upstream.base_url, "http://collector:4000");
    assert_eq!(cfg.downstream.base_url, "http://collector:4000");
    assert_eq!(cfg.upstream.timeout, Duration::from_millis(1500));
    assert_eq!(cfg.upstream.backoff, Duration::from_secs(45));
    assert_eq!(cfg.downstream.queue_capacity, 8);
    assert_eq!(cfg.roi.store, RoiStoreKind::Memory);
    assert_eq!(cfg.pipeline.target_fps, 5);
    assert!(!cfg.pipeline.auto_roi);
    assert_eq!(cfg.engine.backend, EngineBackend::Scripted);
    // The class list narrows what is reported; the model's label map is untouched.
    assert_eq!(cfg.pipeline.target_labels, vec!["bus", "truck"]);
    assert_eq!(cfg.engine.labels, vec!["car", "bus"]);
    assert_eq!(cfg.engine.confidence, 0.3);
    assert_eq!(cfg.engine.iou, 0.6);
    assert_eq!(cfg.congestion.alpha, 4.0);
    assert_eq!(cfg.congestion.weights.get("bus"), Some(&2.5));

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [upstream]
        base_url = "http://metadata:3001"
        default_ttl_secs = 120

        [downstream]
        enabled = false

        [roi]
        store = "json"
        path = "zones/roi.json"
    "#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("TRAFFIC_VIEW_CONFIG", file.path());
    std::env::set_var("ROI_STORE_PATH", "/var/lib/traffic-view/roi.json");

    let cfg = ServiceConfig::load().expect("load config");
    assert_eq!(cfg.upstream.default_ttl, Duration::from_secs(120));
    assert!(!cfg.downstream.enabled);
    assert_eq!(cfg.roi.store, RoiStoreKind::Json);
    assert_eq!(cfg.roi.path, PathBuf::from("/var/lib/traffic-view/roi.json"));

    clear_env();
}

#[test]
fn rejects_bad_overrides_and_unknown_sections() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CONF_THRES", "high");
    assert!(ServiceConfig::load().is_err());
    std::env::set_var("CONF_THRES", "1.7");
    assert!(ServiceConfig::load().is_err());
    std::env::remove_var("CONF_THRES");

    std::env::set_var("TRAFFIC_VIEW_ADDR", "not-an-address");
    assert!(ServiceConfig::load().is_err());
    std::env::remove_var("TRAFFIC_VIEW_ADDR");

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "legacy": {} }"#).expect("write config");
    std::env::set_var("TRAFFIC_VIEW_CONFIG", file.path());
    assert!(ServiceConfig::load().is_err());

    clear_env();
}

#[test]
fn builds_context_with_memory_store_and_stub_upstream() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(
        br#"{
            "upstream": { "base_url": "stub://cam{id}?width=64&height=48&fps=0" },
            "downstream": { "enabled": false },
            "roi": { "store": "memory" },
            "engine": { "backend": "scripted" }
        }"#,
    )
    .expect("write config");
    std::env::set_var("TRAFFIC_VIEW_CONFIG", file.path());

    let cfg = ServiceConfig::load().expect("load config");
    let ctx = cfg.build_context().expect("build context");
    assert!(ctx.forwarder.is_none());
    assert_eq!(ctx.adapter.engine_name(), "scripted");
    let endpoint = ctx.resolver.resolve(7).expect("stub resolution");
    assert_eq!(endpoint.address, "stub://cam7?width=64&height=48&fps=0");
    assert!(ctx.rois.get(7).expect("roi lookup").is_none());

    clear_env();
}

#[test]
fn yolo_classes_filters_targets_without_renaming_model_classes() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("YOLO_CLASSES", "버스,트럭");
    let cfg = ServiceConfig::load().expect("load config");
    assert_eq!(cfg.engine.labels[0], "승용차");
    assert_eq!(cfg.engine.labels.len(), 5);
    assert_eq!(cfg.pipeline.target_labels, vec!["버스", "트럭"]);

    clear_env();
}
