//! Disk-backed mirror of one kind of coordinator state, keyed by cluster id.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::path_lock;
use crate::domain::errors::{AgentError, AgentResult};

/// Cluster id under which data shared by every cluster is stored.
pub const COMMON_CLUSTER_ID: &str = "-1";

/// Immutable view of a cache: cluster id to frozen JSON.
pub type CacheSnapshot = BTreeMap<String, Arc<Value>>;

/// Called after every rewrite with the delta and the new snapshot.
pub type UpdateCallback = Arc<dyn Fn(&CacheDelta, &CacheSnapshot) + Send + Sync>;

/// Cluster ids touched by a rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheDelta {
    /// Clusters that did not exist before.
    pub added: Vec<String>,
    /// Clusters that are gone.
    pub removed: Vec<String>,
    /// Clusters whose content differs.
    pub changed: Vec<String>,
}

impl CacheDelta {
    /// Whether the rewrite changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Default)]
struct CacheState {
    clusters: Arc<CacheSnapshot>,
    hash: Option<String>,
}

/// One cache kind: an immutable snapshot in memory, a JSON file on disk.
pub struct ClusterCache {
    kind: String,
    path: PathBuf,
    hash_path: PathBuf,
    state: RwLock<CacheState>,
    callbacks: RwLock<Vec<UpdateCallback>>,
}

impl fmt::Debug for ClusterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCache")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ClusterCache {
    /// Open the cache of `kind` stored under `cache_dir`.
    ///
    /// An existing `<kind>.json` is adopted. A missing or unreadable file
    /// yields an empty cache; startup never fails on cache contents.
    pub fn open(cache_dir: &Path, kind: &str) -> Self {
        let path = cache_dir.join(format!("{kind}.json"));
        let hash_path = cache_dir.join(format!("{kind}.json.hash"));
        let cache = Self {
            kind: kind.to_string(),
            path,
            hash_path,
            state: RwLock::new(CacheState::default()),
            callbacks: RwLock::new(Vec::new()),
        };
        cache.load_from_disk();
        cache
    }

    /// Cache kind, also the file stem.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// File the snapshot is persisted to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the persisted file, replacing the in-memory state.
    pub fn reload(&self) {
        self.load_from_disk();
    }

    fn load_from_disk(&self) {
        let lock = path_lock::lock_for(&self.path);
        let (clusters, hash) = {
            let _guard = path_lock::acquire(&lock);
            match read_snapshot(&self.path) {
                Ok(Some(clusters)) => (clusters, read_hash(&self.hash_path)),
                Ok(None) => {
                    info!(kind = %self.kind, path = %self.path.display(), "no cache file, starting empty");
                    (CacheSnapshot::new(), None)
                }
                Err(err) => {
                    warn!(kind = %self.kind, error = %err, "discarding unreadable cache file");
                    (CacheSnapshot::new(), None)
                }
            }
        };

        debug!(kind = %self.kind, clusters = clusters.len(), "cache loaded");
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.clusters = Arc::new(clusters);
        state.hash = hash;
    }

    /// Replace the whole cache with `clusters`, then notify and persist.
    ///
    /// The in-memory swap happens even if persisting fails; the error is
    /// returned so the caller can log it.
    pub fn rewrite(
        &self,
        clusters: BTreeMap<String, Value>,
        hash: Option<String>,
    ) -> AgentResult<CacheDelta> {
        let frozen: CacheSnapshot = clusters
            .into_iter()
            .map(|(id, value)| (id, Arc::new(value)))
            .collect();
        let frozen = Arc::new(frozen);

        // Holding the path lock across swap and write keeps the file in the
        // same order as the in-memory rewrites.
        let lock = path_lock::lock_for(&self.path);
        let (delta, persisted) = {
            let _guard = path_lock::acquire(&lock);
            let delta = {
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                let delta = diff(&state.clusters, &frozen);
                state.clusters = Arc::clone(&frozen);
                state.hash.clone_from(&hash);
                delta
            };
            (delta, self.write_files(&frozen, hash.as_deref()))
        };

        info!(
            kind = %self.kind,
            added = delta.added.len(),
            removed = delta.removed.len(),
            changed = delta.changed.len(),
            "cache rewritten"
        );

        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(&delta, &frozen);
        }

        persisted.map(|()| delta)
    }

    /// Write the current state to disk atomically.
    pub fn persist(&self) -> AgentResult<()> {
        let lock = path_lock::lock_for(&self.path);
        let _guard = path_lock::acquire(&lock);
        let (clusters, hash) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            (Arc::clone(&state.clusters), state.hash.clone())
        };
        self.write_files(&clusters, hash.as_deref())
    }

    /// Caller must hold the path lock.
    fn write_files(&self, clusters: &CacheSnapshot, hash: Option<&str>) -> AgentResult<()> {
        let mut map = Map::new();
        for (id, value) in clusters {
            map.insert(id.clone(), Value::clone(value));
        }
        let body = serde_json::to_vec_pretty(&Value::Object(map))?;
        write_atomic(&self.path, &body)?;
        match hash {
            Some(hash) => write_atomic(&self.hash_path, hash.as_bytes())?,
            None => match fs::remove_file(&self.hash_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        debug!(kind = %self.kind, path = %self.path.display(), "cache persisted");
        Ok(())
    }

    /// Content of one cluster.
    pub fn get(&self, cluster_id: &str) -> Option<Arc<Value>> {
        self.snapshot().get(cluster_id).cloned()
    }

    /// Current content; later rewrites never change a snapshot already handed out.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(
            &self
                .state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clusters,
        )
    }

    /// Ids of real clusters; the common-data entry is excluded.
    pub fn get_cluster_ids(&self) -> Vec<String> {
        self.snapshot()
            .keys()
            .filter(|id| id.as_str() != COMMON_CLUSTER_ID)
            .cloned()
            .collect()
    }

    /// Coordinator-supplied version of the current contents.
    pub fn hash(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hash
            .clone()
    }

    /// Register a callback run after every rewrite.
    pub fn on_update(&self, callback: UpdateCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

fn diff(old: &CacheSnapshot, new: &CacheSnapshot) -> CacheDelta {
    let mut delta = CacheDelta::default();
    for (id, value) in new {
        match old.get(id) {
            None => delta.added.push(id.clone()),
            Some(previous) if previous != value => delta.changed.push(id.clone()),
            Some(_) => {}
        }
    }
    delta.removed = old.keys().filter(|id| !new.contains_key(*id)).cloned().collect();
    delta
}

fn read_snapshot(path: &Path) -> AgentResult<Option<CacheSnapshot>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let parsed: Map<String, Value> =
        serde_json::from_slice(&bytes).map_err(|e| AgentError::CacheCorruption {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(Some(
        parsed
            .into_iter()
            .map(|(id, value)| (id, Arc::new(value)))
            .collect(),
    ))
}

fn read_hash(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Write `bytes` to `path` through a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> AgentResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| AgentError::Io(e.error))?;
    Ok(())
}
