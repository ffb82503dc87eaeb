//! Region-of-interest configuration: persistence, caching and filtering.

pub mod auto;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::UNIX_EPOCH;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::geometry::{classify_direction, is_inside, DirectionalZones, Polygon};
use crate::CameraId;

pub use auto::{estimate_road_polygon, AutoRoiState};

/// Directional zones stored for one camera.
#[derive(Clone, Debug, PartialEq)]
pub struct RoiConfig {
    pub camera_id: CameraId,
    pub upstream: Option<Polygon>,
    pub downstream: Option<Polygon>,
}

impl RoiConfig {
    pub fn new(camera_id: CameraId, upstream: Option<Polygon>, downstream: Option<Polygon>) -> Self {
        Self {
            camera_id,
            upstream,
            downstream,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_none() && self.downstream.is_none()
    }

    pub fn zones(&self) -> DirectionalZones<'_> {
        DirectionalZones {
            upstream: self.upstream.as_ref(),
            downstream: self.downstream.as_ref(),
        }
    }

    fn from_entry(camera_id: CameraId, entry: RoiEntry) -> Option<Self> {
        let upstream = entry
            .upstream
            .or(entry.roi_polygon)
            .and_then(|pts| Polygon::from_pairs(&pts));
        let downstream = entry.downstream.and_then(|pts| Polygon::from_pairs(&pts));
        let config = Self::new(camera_id, upstream, downstream);
        (!config.is_empty()).then_some(config)
    }

    fn to_entry(&self) -> RoiEntry {
        RoiEntry {
            upstream: self.upstream.as_ref().map(Polygon::to_pairs),
            downstream: self.downstream.as_ref().map(Polygon::to_pairs),
            roi_polygon: None,
        }
    }
}

/// On-disk / wire shape of one camera's zones. Point lists are kept raw so
/// that short lists load as "absent" instead of failing the whole document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoiEntry {
    #[serde(default)]
    pub upstream: Option<Vec<[f32; 2]>>,
    #[serde(default)]
    pub downstream: Option<Vec<[f32; 2]>>,
    #[serde(rename = "roiPolygon", default, skip_serializing_if = "Option::is_none")]
    pub roi_polygon: Option<Vec<[f32; 2]>>,
}

impl RoiEntry {
    pub fn into_config(self, camera_id: CameraId) -> Option<RoiConfig> {
        RoiConfig::from_entry(camera_id, self)
    }

    pub fn from_config(config: Option<&RoiConfig>) -> Self {
        config.map(RoiConfig::to_entry).unwrap_or_default()
    }
}

/// ROI in effect for one tick.
#[derive(Clone, Debug, PartialEq)]
pub enum ActiveRoi {
    Stored(RoiConfig),
    Auto(Polygon),
    None,
}

impl ActiveRoi {
    /// Stored zones classify and drop unzoned detections; an auto ROI is a
    /// plain inclusion mask; no ROI passes everything through undirected.
    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        match self {
            ActiveRoi::None => detections,
            ActiveRoi::Auto(mask) => detections
                .into_iter()
                .filter(|d| is_inside(d.bbox.center(), mask))
                .collect(),
            ActiveRoi::Stored(config) => {
                let zones = config.zones();
                if zones.is_empty() {
                    return detections;
                }
                detections
                    .into_iter()
                    .filter_map(|d| {
                        let direction = classify_direction(&d, &zones)?;
                        Some(d.with_direction(Some(direction)))
                    })
                    .collect()
            }
        }
    }

    /// Polygon reported as `roiPolygon` to consumers.
    pub fn primary_polygon(&self) -> Option<&Polygon> {
        match self {
            ActiveRoi::Stored(config) => config.upstream.as_ref().or(config.downstream.as_ref()),
            ActiveRoi::Auto(poly) => Some(poly),
            ActiveRoi::None => None,
        }
    }

    pub fn upstream(&self) -> Option<&Polygon> {
        match self {
            ActiveRoi::Stored(config) => config.upstream.as_ref(),
            _ => None,
        }
    }

    pub fn downstream(&self) -> Option<&Polygon> {
        match self {
            ActiveRoi::Stored(config) => config.downstream.as_ref(),
            _ => None,
        }
    }
}

/// Key-value persistence of ROI configs.
pub trait RoiStore: Send {
    fn load(&mut self, camera_id: CameraId) -> Result<Option<RoiConfig>>;
    fn save(&mut self, config: &RoiConfig) -> Result<()>;
    fn delete(&mut self, camera_id: CameraId) -> Result<()>;

    /// Token that changes when the backing data is written by another
    /// process. Stores private to this process keep the default.
    fn revision(&mut self) -> Result<u64> {
        Ok(0)
    }
}

/// Single JSON document keyed by camera id string.
pub struct JsonFileRoiStore {
    path: PathBuf,
}

impl JsonFileRoiStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    fn read_document(&self) -> Result<BTreeMap<String, RoiEntry>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read roi file {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid roi file {}: {}", self.path.display(), e))
    }

    fn write_document(&self, doc: &BTreeMap<String, RoiEntry>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(doc)?;
        fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl RoiStore for JsonFileRoiStore {
    fn load(&mut self, camera_id: CameraId) -> Result<Option<RoiConfig>> {
        let mut doc = self.read_document()?;
        Ok(doc
            .remove(&camera_id.to_string())
            .and_then(|entry| entry.into_config(camera_id)))
    }

    fn save(&mut self, config: &RoiConfig) -> Result<()> {
        let mut doc = self.read_document()?;
        doc.insert(config.camera_id.to_string(), config.to_entry());
        self.write_document(&doc)?;
        log::info!(
            "roi updated for camera {}: up={}, down={}",
            config.camera_id,
            config.upstream.as_ref().map_or(0, |p| p.points().len()),
            config.downstream.as_ref().map_or(0, |p| p.points().len())
        );
        Ok(())
    }

    fn delete(&mut self, camera_id: CameraId) -> Result<()> {
        let mut doc = self.read_document()?;
        if doc.remove(&camera_id.to_string()).is_some() {
            self.write_document(&doc)?;
        }
        Ok(())
    }

    /// Modification time mixed with length. Writes replace the file.
    fn revision(&mut self) -> Result<u64> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", self.path.display()))
            }
        };
        let modified = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok((modified.as_nanos() as u64) ^ meta.len().rotate_left(40))
    }
}

pub struct SqliteRoiStore {
    conn: Connection,
}

impl SqliteRoiStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open roi database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS roi_configs (
                camera_id INTEGER PRIMARY KEY,
                upstream_json TEXT,
                downstream_json TEXT,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

fn polygon_column(raw: Option<String>) -> Result<Option<Polygon>> {
    match raw {
        None => Ok(None),
        Some(text) => {
            let pts: Vec<[f32; 2]> = serde_json::from_str(&text)?;
            Ok(Polygon::from_pairs(&pts))
        }
    }
}

impl RoiStore for SqliteRoiStore {
    fn load(&mut self, camera_id: CameraId) -> Result<Option<RoiConfig>> {
        let row: Option<(Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT upstream_json, downstream_json FROM roi_configs WHERE camera_id = ?1",
                params![camera_id as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((up, down)) = row else {
            return Ok(None);
        };
        let config = RoiConfig::new(camera_id, polygon_column(up)?, polygon_column(down)?);
        Ok((!config.is_empty()).then_some(config))
    }

    fn save(&mut self, config: &RoiConfig) -> Result<()> {
        let up = config
            .upstream
            .as_ref()
            .map(|p| serde_json::to_string(p))
            .transpose()?;
        let down = config
            .downstream
            .as_ref()
            .map(|p| serde_json::to_string(p))
            .transpose()?;
        self.conn.execute(
            "INSERT INTO roi_configs (camera_id, upstream_json, downstream_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(camera_id) DO UPDATE SET
                upstream_json = excluded.upstream_json,
                downstream_json = excluded.downstream_json,
                updated_at = excluded.updated_at",
            params![config.camera_id as i64, up, down, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete(&mut self, camera_id: CameraId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM roi_configs WHERE camera_id = ?1",
            params![camera_id as i64],
        )?;
        Ok(())
    }

    /// `data_version` moves only on commits from other connections.
    fn revision(&mut self) -> Result<u64> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA data_version", [], |row| row.get(0))?;
        Ok(version as u64)
    }
}

#[derive(Default)]
pub struct InMemoryRoiStore {
    configs: HashMap<CameraId, RoiConfig>,
}

impl RoiStore for InMemoryRoiStore {
    fn load(&mut self, camera_id: CameraId) -> Result<Option<RoiConfig>> {
        Ok(self.configs.get(&camera_id).cloned())
    }

    fn save(&mut self, config: &RoiConfig) -> Result<()> {
        if config.is_empty() {
            self.configs.remove(&config.camera_id);
        } else {
            self.configs.insert(config.camera_id, config.clone());
        }
        Ok(())
    }

    fn delete(&mut self, camera_id: CameraId) -> Result<()> {
        self.configs.remove(&camera_id);
        Ok(())
    }
}

pub const DEFAULT_MAX_CACHED_CAMERAS: usize = 1024;

/// Shared, caching front for a `RoiStore`.
///
/// Lookups (including "no config") are cached per camera. A write through
/// the registry drops that camera's entry; a write by another process is
/// seen through the store revision, which drops the whole cache. Loads
/// and cache fills happen under one lock so a concurrent write cannot be
/// overtaken by a stale fill.
pub struct RoiRegistry {
    state: Mutex<RegistryState>,
    max_cached: usize,
}

struct RegistryState {
    store: Box<dyn RoiStore>,
    cache: HashMap<CameraId, Option<RoiConfig>>,
    revision: u64,
}

impl RegistryState {
    fn sync_revision(&mut self) -> Result<()> {
        let revision = self.store.revision()?;
        if revision != self.revision {
            if !self.cache.is_empty() {
                log::debug!(
                    "roi store changed externally, dropping {} cached cameras",
                    self.cache.len()
                );
            }
            self.cache.clear();
            self.revision = revision;
        }
        Ok(())
    }
}

impl RoiRegistry {
    pub fn new(store: Box<dyn RoiStore>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                store,
                cache: HashMap::new(),
                revision: 0,
            }),
            max_cached: DEFAULT_MAX_CACHED_CAMERAS,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::<InMemoryRoiStore>::default())
    }

    pub fn with_max_cached(mut self, max_cached: usize) -> Self {
        self.max_cached = max_cached.max(1);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("roi store lock poisoned"))
    }

    pub fn get(&self, camera_id: CameraId) -> Result<Option<RoiConfig>> {
        let mut state = self.lock()?;
        state.sync_revision()?;
        if let Some(hit) = state.cache.get(&camera_id) {
            return Ok(hit.clone());
        }
        let loaded = state.store.load(camera_id)?;
        if state.cache.len() >= self.max_cached {
            // Absent entries go first, then everything.
            state.cache.retain(|_, entry| entry.is_some());
            if state.cache.len() >= self.max_cached {
                state.cache.clear();
            }
        }
        state.cache.insert(camera_id, loaded.clone());
        Ok(loaded)
    }

    pub fn save(&self, config: RoiConfig) -> Result<()> {
        let mut state = self.lock()?;
        state.store.save(&config)?;
        state.cache.remove(&config.camera_id);
        Ok(())
    }

    pub fn clear(&self, camera_id: CameraId) -> Result<()> {
        let mut state = self.lock()?;
        state.store.delete(camera_id)?;
        state.cache.remove(&camera_id);
        Ok(())
    }

    pub fn cached_cameras(&self) -> usize {
        self.lock().map(|state| state.cache.len()).unwrap_or(0)
    }
}
