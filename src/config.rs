use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::api::{ApiConfig, DEFAULT_SNAPSHOT_TIMEOUT};
use crate::congestion::{CongestionAggregator, DEFAULT_ALPHA};
use crate::detect::backends::ScriptedEngine;
use crate::detect::{DetectionAdapter, InferenceEngine, Thresholds};
use crate::enhance::EnhanceParams;
use crate::forward::{
    ForwardQueue, Forwarder, HttpForwarder, DEFAULT_FORWARD_TIMEOUT, DEFAULT_QUEUE_CAPACITY,
};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::ingest::DefaultSourceOpener;
use crate::overlay::FontCache;
use crate::resolver::{
    HttpMetadataClient, MetadataClient, StaticMetadataClient, StreamResolver, DEFAULT_BACKOFF,
    DEFAULT_METADATA_TIMEOUT, DEFAULT_TTL,
};
use crate::roi::{InMemoryRoiStore, JsonFileRoiStore, RoiRegistry, RoiStore, SqliteRoiStore};
use crate::session::{
    PipelineContext, PipelineSettings, DEFAULT_REOPEN_DELAY, DEFAULT_TARGET_FPS,
    DEFAULT_TARGET_LABELS,
};

const DEFAULT_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_BACKEND_BASE: &str = "http://backend:3001";
const DEFAULT_ROI_JSON_PATH: &str = "roi_configs.json";
const DEFAULT_ROI_SQLITE_PATH: &str = "roi_configs.db";
const DEFAULT_MODEL_PATH: &str = "models/yolo/v1/model.onnx";
const DEFAULT_MODEL_LABELS: &str = "승용차,버스,트럭,오토바이(자전거),분류없음";
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_INPUT_SIZE: u32 = 640;
/// Upstream base URLs with this scheme resolve locally from a template.
const STATIC_UPSTREAM_SCHEME: &str = "stub://";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServiceConfigFile {
    server: Option<ServerConfigFile>,
    upstream: Option<UpstreamConfigFile>,
    downstream: Option<DownstreamConfigFile>,
    roi: Option<RoiConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    engine: Option<EngineConfigFile>,
    congestion: Option<CongestionConfigFile>,
    fonts: Option<FontsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
    snapshot_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct UpstreamConfigFile {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
    backoff_secs: Option<u64>,
    default_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DownstreamConfigFile {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
    enabled: Option<bool>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RoiConfigFile {
    store: Option<RoiStoreKind>,
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    target_fps: Option<u32>,
    jpeg_quality: Option<u8>,
    auto_roi: Option<bool>,
    target_labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    backend: Option<EngineBackend>,
    model_path: Option<PathBuf>,
    model_url: Option<String>,
    labels: Option<Vec<String>>,
    confidence: Option<f32>,
    iou: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CongestionConfigFile {
    alpha: Option<f32>,
    weights: Option<HashMap<String, f32>>,
}

#[derive(Debug, Deserialize, Default)]
struct FontsConfigFile {
    paths: Option<Vec<PathBuf>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiStoreKind {
    Json,
    Sqlite,
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// Replays nothing; every frame yields no detections. For demos.
    Scripted,
    Tract,
}

impl EngineBackend {
    fn default_for_build() -> Self {
        if cfg!(feature = "backend-tract") {
            EngineBackend::Tract
        } else {
            EngineBackend::Scripted
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub downstream: DownstreamSettings,
    pub roi: RoiSettings,
    pub pipeline: PipelineSection,
    pub engine: EngineSettings,
    pub congestion: CongestionSettings,
    pub font_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: String,
    pub snapshot_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub backoff: Duration,
    pub default_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct DownstreamSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub enabled: bool,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct RoiSettings {
    pub store: RoiStoreKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PipelineSection {
    pub target_fps: u32,
    pub jpeg_quality: u8,
    pub auto_roi: bool,
    pub target_labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backend: EngineBackend,
    pub model_path: PathBuf,
    pub model_url: Option<String>,
    pub labels: Vec<String>,
    pub confidence: f32,
    pub iou: f32,
    pub input_size: u32,
}

#[derive(Debug, Clone)]
pub struct CongestionSettings {
    pub alpha: f32,
    pub weights: HashMap<String, f32>,
}

impl ServiceConfig {
    /// Optional file named by `TRAFFIC_VIEW_CONFIG`, then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRAFFIC_VIEW_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Self {
        let server = file.server.unwrap_or_default();
        let upstream = file.upstream.unwrap_or_default();
        let downstream = file.downstream.unwrap_or_default();
        let roi = file.roi.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let engine = file.engine.unwrap_or_default();
        let congestion = file.congestion.unwrap_or_default();

        let upstream_base = upstream
            .base_url
            .unwrap_or_else(|| DEFAULT_BACKEND_BASE.to_string());
        let store = roi.store.unwrap_or(RoiStoreKind::Json);
        let roi_path = roi.path.unwrap_or_else(|| {
            PathBuf::from(match store {
                RoiStoreKind::Sqlite => DEFAULT_ROI_SQLITE_PATH,
                _ => DEFAULT_ROI_JSON_PATH,
            })
        });

        Self {
            server: ServerSettings {
                addr: server.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
                snapshot_timeout: server
                    .snapshot_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_SNAPSHOT_TIMEOUT),
            },
            downstream: DownstreamSettings {
                base_url: downstream.base_url.unwrap_or_else(|| upstream_base.clone()),
                timeout: downstream
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_FORWARD_TIMEOUT),
                enabled: downstream.enabled.unwrap_or(true),
                queue_capacity: downstream.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            },
            upstream: UpstreamSettings {
                base_url: upstream_base,
                timeout: upstream
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_METADATA_TIMEOUT),
                backoff: upstream
                    .backoff_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_BACKOFF),
                default_ttl: upstream
                    .default_ttl_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_TTL),
            },
            roi: RoiSettings {
                store,
                path: roi_path,
            },
            pipeline: PipelineSection {
                target_fps: pipeline.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                jpeg_quality: pipeline.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                auto_roi: pipeline.auto_roi.unwrap_or(true),
                target_labels: pipeline.target_labels.unwrap_or_else(|| {
                    DEFAULT_TARGET_LABELS.iter().map(|l| l.to_string()).collect()
                }),
            },
            engine: EngineSettings {
                backend: engine.backend.unwrap_or_else(EngineBackend::default_for_build),
                model_path: engine
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                model_url: engine.model_url,
                labels: engine
                    .labels
                    .unwrap_or_else(|| split_csv(DEFAULT_MODEL_LABELS)),
                confidence: engine.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                iou: engine.iou.unwrap_or(DEFAULT_IOU),
                input_size: engine.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            },
            congestion: CongestionSettings {
                alpha: congestion.alpha.unwrap_or(DEFAULT_ALPHA),
                weights: congestion.weights.unwrap_or_default(),
            },
            font_paths: file.fonts.and_then(|f| f.paths).unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_nonempty("TRAFFIC_VIEW_ADDR") {
            self.server.addr = addr;
        }
        if let Some(base) = env_nonempty("BACKEND_BASE") {
            self.upstream.base_url = base.clone();
            self.downstream.base_url = base;
        }
        if let Some(fps) = env_nonempty("TRAFFIC_VIEW_TARGET_FPS") {
            self.pipeline.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("TRAFFIC_VIEW_TARGET_FPS must be a non-negative integer"))?;
        }
        if let Some(path) = env_nonempty("MODEL_PATH") {
            self.engine.model_path = PathBuf::from(path);
        }
        if let Some(url) = env_nonempty("MODEL_URL") {
            self.engine.model_url = Some(url);
        }
        if let Some(classes) = env_nonempty("YOLO_CLASSES") {
            let parsed = split_csv(&classes);
            if !parsed.is_empty() {
                self.pipeline.target_labels = parsed;
            }
        }
        if let Some(conf) = env_nonempty("CONF_THRES") {
            self.engine.confidence = conf
                .parse()
                .map_err(|_| anyhow!("CONF_THRES must be a number"))?;
        }
        if let Some(iou) = env_nonempty("IOU_THRES") {
            self.engine.iou = iou
                .parse()
                .map_err(|_| anyhow!("IOU_THRES must be a number"))?;
        }
        if let Some(path) = env_nonempty("ROI_STORE_PATH") {
            self.roi.path = PathBuf::from(path);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.server
            .addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| anyhow!("server.addr '{}' is not a socket address", self.server.addr))?;
        for (name, value) in [
            ("engine.confidence", self.engine.confidence),
            ("engine.iou", self.engine.iou),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.engine.labels.is_empty() {
            return Err(anyhow!("engine.labels must not be empty"));
        }
        if self.pipeline.target_labels.is_empty() {
            return Err(anyhow!("pipeline.target_labels must not be empty"));
        }
        if self.engine.input_size == 0 || self.engine.input_size % 32 != 0 {
            return Err(anyhow!(
                "engine.input_size must be a positive multiple of 32, got {}",
                self.engine.input_size
            ));
        }
        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return Err(anyhow!("pipeline.jpeg_quality must be within 1..=100"));
        }
        if !self.congestion.alpha.is_finite() || self.congestion.alpha < 0.0 {
            return Err(anyhow!("congestion.alpha must be a non-negative number"));
        }
        if let Some((label, weight)) = self
            .congestion
            .weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(anyhow!("congestion weight for '{}' is invalid: {}", label, weight));
        }
        for base in [&mut self.upstream.base_url, &mut self.downstream.base_url] {
            let trimmed = base.trim().trim_end_matches('/').to_string();
            if trimmed.is_empty() {
                return Err(anyhow!("backend base url must not be empty"));
            }
            *base = trimmed;
        }
        if !self.upstream.base_url.starts_with(STATIC_UPSTREAM_SCHEME) {
            url::Url::parse(&self.upstream.base_url)
                .with_context(|| format!("invalid upstream base url '{}'", self.upstream.base_url))?;
        }
        if self.downstream.enabled {
            url::Url::parse(&self.downstream.base_url).with_context(|| {
                format!("invalid downstream base url '{}'", self.downstream.base_url)
            })?;
        }
        if self.downstream.queue_capacity == 0 {
            return Err(anyhow!("downstream.queue_capacity must be greater than zero"));
        }
        Ok(())
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.server.addr.clone(),
            snapshot_timeout: self.server.snapshot_timeout,
        }
    }

    pub fn open_roi_store(&self) -> Result<Box<dyn RoiStore>> {
        Ok(match self.roi.store {
            RoiStoreKind::Json => Box::new(JsonFileRoiStore::open(&self.roi.path)?),
            RoiStoreKind::Sqlite => {
                let path = self
                    .roi
                    .path
                    .to_str()
                    .ok_or_else(|| anyhow!("roi.path must be valid UTF-8"))?;
                Box::new(SqliteRoiStore::open(path)?)
            }
            RoiStoreKind::Memory => Box::<InMemoryRoiStore>::default(),
        })
    }

    fn metadata_client(&self) -> Arc<dyn MetadataClient> {
        match self.upstream.base_url.strip_prefix(STATIC_UPSTREAM_SCHEME) {
            // `stub://{id}` style templates keep the scheme for the source opener.
            Some(_) => Arc::new(StaticMetadataClient::new(&self.upstream.base_url)),
            None => Arc::new(HttpMetadataClient::new(
                &self.upstream.base_url,
                self.upstream.timeout,
            )),
        }
    }

    fn engine(&self) -> Result<Arc<dyn InferenceEngine>> {
        match self.engine.backend {
            EngineBackend::Scripted => Ok(Arc::new(ScriptedEngine::new())),
            #[cfg(feature = "backend-tract")]
            EngineBackend::Tract => Ok(Arc::new(crate::detect::backends::TractEngine::new(
                &self.engine.model_path,
                self.engine.model_url.clone(),
                self.engine.labels.clone(),
                self.engine.input_size,
            ))),
            #[cfg(not(feature = "backend-tract"))]
            EngineBackend::Tract => Err(anyhow!(
                "engine backend 'tract' requires the backend-tract feature"
            )),
        }
    }

    fn forwarder(&self) -> Result<Option<Arc<dyn Forwarder>>> {
        if !self.downstream.enabled {
            return Ok(None);
        }
        let http = HttpForwarder::new(&self.downstream.base_url, self.downstream.timeout);
        let queue = ForwardQueue::spawn(Box::new(http), self.downstream.queue_capacity)?;
        Ok(Some(Arc::new(queue)))
    }

    /// Shared state handed to every session.
    pub fn build_context(&self) -> Result<PipelineContext> {
        let resolver = StreamResolver::new(self.metadata_client())
            .with_timings(self.upstream.default_ttl, self.upstream.backoff);
        let thresholds = Thresholds {
            confidence: self.engine.confidence,
            iou: self.engine.iou,
        };
        let target_labels: HashSet<String> =
            self.pipeline.target_labels.iter().cloned().collect();
        Ok(PipelineContext {
            resolver: Arc::new(resolver),
            opener: Arc::new(DefaultSourceOpener),
            adapter: Arc::new(DetectionAdapter::new(self.engine()?, thresholds)),
            rois: Arc::new(RoiRegistry::new(self.open_roi_store()?)),
            aggregator: CongestionAggregator::new(
                self.congestion.alpha,
                self.congestion.weights.clone(),
            ),
            forwarder: self.forwarder()?,
            fonts: Arc::new(FontCache::new(self.font_paths.clone())),
            settings: PipelineSettings {
                target_fps: self.pipeline.target_fps,
                jpeg_quality: self.pipeline.jpeg_quality,
                auto_roi: self.pipeline.auto_roi,
                target_labels,
                enhance: EnhanceParams::default(),
                reopen_delay: DEFAULT_REOPEN_DELAY,
            },
        })
    }
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
