//! Camera id to playable stream address, with TTL caching and 429 backoff.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::error::PipelineError;
use crate::CameraId;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(2);
/// Camera count above which idle entries are pruned on insert.
pub const DEFAULT_MAX_TRACKED_CAMERAS: usize = 1024;

/// Values above this are epoch milliseconds rather than seconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamEndpoint {
    pub camera_id: CameraId,
    pub address: String,
    pub expires_at: DateTime<Utc>,
}

/// Response envelope of the metadata service.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StreamEnvelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<StreamData>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamData {
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub cached_until: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("metadata service answered 429")]
    TooManyRequests,
    #[error("{0}")]
    Failed(String),
}

/// Transport to the metadata service.
pub trait MetadataClient: Send + Sync {
    fn fetch(&self, camera_id: CameraId) -> Result<StreamEnvelope, FetchError>;
}

/// `GET {base}/api/cctv/{id}/stream`.
pub struct HttpMetadataClient {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpMetadataClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl MetadataClient for HttpMetadataClient {
    fn fetch(&self, camera_id: CameraId) -> Result<StreamEnvelope, FetchError> {
        let url = format!("{}/api/cctv/{}/stream", self.base_url, camera_id);
        match self.agent.get(&url).call() {
            Ok(response) => response
                .into_json::<StreamEnvelope>()
                .map_err(|e| FetchError::Failed(format!("invalid metadata response: {}", e))),
            Err(ureq::Error::Status(429, _)) => Err(FetchError::TooManyRequests),
            Err(ureq::Error::Status(code, _)) => {
                Err(FetchError::Failed(format!("metadata service answered {}", code)))
            }
            Err(err) => Err(FetchError::Failed(err.to_string())),
        }
    }
}

/// Resolves every camera from an address template, `{id}` being replaced
/// by the camera id. Used for demos and local testing without a metadata
/// service.
pub struct StaticMetadataClient {
    template: String,
}

impl StaticMetadataClient {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }
}

impl MetadataClient for StaticMetadataClient {
    fn fetch(&self, camera_id: CameraId) -> Result<StreamEnvelope, FetchError> {
        Ok(StreamEnvelope {
            success: true,
            message: None,
            data: Some(StreamData {
                stream_url: Some(self.template.replace("{id}", &camera_id.to_string())),
                cached_until: None,
            }),
        })
    }
}

#[derive(Debug, Default)]
struct CameraEntry {
    endpoint: Option<StreamEndpoint>,
    last_429_at: Option<DateTime<Utc>>,
}

/// Shared by every session. Each camera has its own lock, so a slow
/// lookup for one camera never blocks another, and fresh entries are read
/// under a shared lock.
pub struct StreamResolver {
    client: Arc<dyn MetadataClient>,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<CameraId, Arc<RwLock<CameraEntry>>>>,
    default_ttl: Duration,
    backoff: Duration,
    max_tracked: usize,
}

impl StreamResolver {
    pub fn new(client: Arc<dyn MetadataClient>) -> Self {
        Self::with_clock(client, Arc::new(SystemClock))
    }

    pub fn with_clock(client: Arc<dyn MetadataClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            entries: RwLock::new(HashMap::new()),
            default_ttl: DEFAULT_TTL,
            backoff: DEFAULT_BACKOFF,
            max_tracked: DEFAULT_MAX_TRACKED_CAMERAS,
        }
    }

    pub fn with_timings(mut self, default_ttl: Duration, backoff: Duration) -> Self {
        self.default_ttl = default_ttl;
        self.backoff = backoff;
        self
    }

    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked.max(1);
        self
    }

    /// Number of cameras with cache or backoff state.
    pub fn tracked_cameras(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn entry(&self, camera_id: CameraId) -> Arc<RwLock<CameraEntry>> {
        if let Ok(entries) = self.entries.read() {
            if let Some(entry) = entries.get(&camera_id) {
                return entry.clone();
            }
        }
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !entries.contains_key(&camera_id) && entries.len() >= self.max_tracked {
            let now = self.clock.now();
            let before = entries.len();
            entries.retain(|_, slot| Arc::strong_count(slot) > 1 || self.is_live(slot, now));
            debug!("pruned {} idle resolver entries", before - entries.len());
        }
        entries.entry(camera_id).or_default().clone()
    }

    /// An entry still matters while its endpoint is fresh or its backoff
    /// is running. Entries locked by a lookup are kept.
    fn is_live(&self, slot: &RwLock<CameraEntry>, now: DateTime<Utc>) -> bool {
        let Ok(entry) = slot.try_read() else {
            return true;
        };
        let fresh = entry
            .endpoint
            .as_ref()
            .is_some_and(|endpoint| now < endpoint.expires_at);
        fresh || self.rate_limited(0, &entry, now).is_some()
    }

    fn rate_limited(
        &self,
        camera_id: CameraId,
        entry: &CameraEntry,
        now: DateTime<Utc>,
    ) -> Option<PipelineError> {
        let last = entry.last_429_at?;
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        (elapsed < self.backoff).then(|| PipelineError::RateLimited {
            camera_id,
            retry_after: self.backoff - elapsed,
        })
    }

    pub fn resolve(&self, camera_id: CameraId) -> Result<StreamEndpoint, PipelineError> {
        let slot = self.entry(camera_id);

        {
            let entry = slot.read().map_err(|_| lock_poisoned(camera_id))?;
            let now = self.clock.now();
            if let Some(err) = self.rate_limited(camera_id, &entry, now) {
                return Err(err);
            }
            if let Some(endpoint) = entry.endpoint.as_ref().filter(|e| now < e.expires_at) {
                return Ok(endpoint.clone());
            }
        }

        let mut entry = slot.write().map_err(|_| lock_poisoned(camera_id))?;
        // Another session may have refreshed while we waited.
        let now = self.clock.now();
        if let Some(err) = self.rate_limited(camera_id, &entry, now) {
            return Err(err);
        }
        if let Some(endpoint) = entry.endpoint.as_ref().filter(|e| now < e.expires_at) {
            return Ok(endpoint.clone());
        }

        let envelope = match self.client.fetch(camera_id) {
            Ok(envelope) => envelope,
            Err(FetchError::TooManyRequests) => {
                warn!("stream lookup for camera {} rate limited", camera_id);
                entry.last_429_at = Some(now);
                return Err(PipelineError::RateLimited {
                    camera_id,
                    retry_after: self.backoff,
                });
            }
            Err(FetchError::Failed(reason)) => {
                return Err(PipelineError::UpstreamUnavailable { camera_id, reason })
            }
        };

        let unavailable = |reason: String| PipelineError::UpstreamUnavailable { camera_id, reason };
        if !envelope.success {
            return Err(unavailable(
                envelope
                    .message
                    .unwrap_or_else(|| "metadata service reported failure".into()),
            ));
        }
        let data = envelope.data.unwrap_or_default();
        let address = data
            .stream_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| unavailable("response has no streamUrl".into()))?;
        let expires_at = data
            .cached_until
            .as_ref()
            .and_then(parse_cached_until)
            .unwrap_or_else(|| now + to_chrono(self.default_ttl));

        info!(
            "resolved camera {} -> {} (cached until {})",
            camera_id,
            address,
            expires_at.to_rfc3339()
        );
        let endpoint = StreamEndpoint {
            camera_id,
            address,
            expires_at,
        };
        entry.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }
}

fn lock_poisoned(camera_id: CameraId) -> PipelineError {
    PipelineError::UpstreamUnavailable {
        camera_id,
        reason: "resolver cache lock poisoned".into(),
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

/// `cachedUntil` as epoch seconds, epoch milliseconds, or an ISO-8601
/// string (RFC 3339, or a naive timestamp taken as UTC).
pub fn parse_cached_until(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => from_epoch(n.as_f64()?),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<f64>() {
                return from_epoch(n);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        _ => None,
    }
}

fn from_epoch(n: f64) -> Option<DateTime<Utc>> {
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    let millis = if n > EPOCH_MILLIS_THRESHOLD { n } else { n * 1000.0 };
    Utc.timestamp_millis_opt(millis as i64).single()
}
