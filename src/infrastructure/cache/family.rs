//! The five cache kinds the coordinator keeps in sync.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use super::cluster_cache::{CacheDelta, ClusterCache};
use crate::domain::errors::AgentResult;
use crate::domain::models::heartbeat::CacheUpdate;

/// The kinds of coordinator state mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKind {
    /// Configuration properties per type.
    Configurations,
    /// Cluster-level metadata such as the cluster name.
    Metadata,
    /// Hosts and the components placed on them.
    Topology,
    /// Host-wide command parameters.
    HostLevelParams,
    /// Alert definitions; stored but not evaluated.
    AlertDefinitions,
}

impl CacheKind {
    /// Every kind, in registration order.
    pub const ALL: [Self; 5] = [
        Self::Configurations,
        Self::Metadata,
        Self::Topology,
        Self::HostLevelParams,
        Self::AlertDefinitions,
    ];

    /// Wire name and file stem.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Configurations => "configurations",
            Self::Metadata => "metadata",
            Self::Topology => "topology",
            Self::HostLevelParams => "host_level_params",
            Self::AlertDefinitions => "alert_definitions",
        }
    }

    /// Kind for a wire name.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cache per kind, all under the same directory.
#[derive(Debug, Clone)]
pub struct CacheFamily {
    /// Configurations cache.
    pub configurations: Arc<ClusterCache>,
    /// Metadata cache.
    pub metadata: Arc<ClusterCache>,
    /// Topology cache.
    pub topology: Arc<ClusterCache>,
    /// Host-level parameters cache.
    pub host_level_params: Arc<ClusterCache>,
    /// Alert definitions cache.
    pub alert_definitions: Arc<ClusterCache>,
}

impl CacheFamily {
    /// Open every kind under `cache_dir`, loading what is persisted there.
    pub fn open(cache_dir: &Path) -> Self {
        let open = |kind: CacheKind| Arc::new(ClusterCache::open(cache_dir, kind.as_str()));
        Self {
            configurations: open(CacheKind::Configurations),
            metadata: open(CacheKind::Metadata),
            topology: open(CacheKind::Topology),
            host_level_params: open(CacheKind::HostLevelParams),
            alert_definitions: open(CacheKind::AlertDefinitions),
        }
    }

    /// Cache of one kind.
    pub const fn get(&self, kind: CacheKind) -> &Arc<ClusterCache> {
        match kind {
            CacheKind::Configurations => &self.configurations,
            CacheKind::Metadata => &self.metadata,
            CacheKind::Topology => &self.topology,
            CacheKind::HostLevelParams => &self.host_level_params,
            CacheKind::AlertDefinitions => &self.alert_definitions,
        }
    }

    /// Hash of every kind that has one, keyed by kind name.
    pub fn hashes(&self) -> BTreeMap<String, String> {
        CacheKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).hash().map(|h| (kind.as_str().to_string(), h)))
            .collect()
    }

    /// Rewrite every kind present in `updates`.
    ///
    /// Unknown kinds are skipped with a warning. All known kinds are applied
    /// even if one fails to persist; the first error is returned.
    pub fn apply_update(
        &self,
        updates: &BTreeMap<String, CacheUpdate>,
    ) -> AgentResult<Vec<(CacheKind, CacheDelta)>> {
        let mut applied = Vec::new();
        let mut first_error = None;

        for (name, update) in updates {
            let Some(kind) = CacheKind::parse(name) else {
                warn!(kind = %name, "ignoring update for unknown cache kind");
                continue;
            };
            match self.get(kind).rewrite(update.clusters.clone(), update.hash.clone()) {
                Ok(delta) => applied.push((kind, delta)),
                Err(err) => {
                    warn!(%kind, error = %err, "failed to persist cache update");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(applied),
        }
    }

    /// Re-read every kind from disk.
    pub fn reload(&self) {
        for kind in CacheKind::ALL {
            self.get(kind).reload();
        }
    }
}
