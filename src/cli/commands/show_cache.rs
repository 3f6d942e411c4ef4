//! Implementation of the `fleet-agent show-cache` command.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cli::output::{output, CommandOutput};
use crate::infrastructure::cache::{CacheFamily, CacheKind};
use crate::infrastructure::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct ShowCacheArgs {
    /// Cache directory (defaults to the configured one)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Only this kind: configurations, metadata, topology, host_level_params, alert_definitions
    #[arg(long)]
    pub kind: Option<String>,

    /// Print full cluster contents instead of a summary
    #[arg(long)]
    pub full: bool,
}

/// One cache kind as printed.
#[derive(Debug, Serialize)]
pub struct CacheKindOutput {
    /// Kind name.
    pub kind: String,
    /// Coordinator hash of the content.
    pub hash: Option<String>,
    /// Content per cluster, or a summary unless `--full`.
    pub clusters: BTreeMap<String, Value>,
}

/// Result of `show-cache`.
#[derive(Debug, Serialize)]
pub struct ShowCacheOutput {
    /// Directory the caches were read from.
    pub cache_dir: PathBuf,
    /// Whether full contents were requested.
    #[serde(skip)]
    pub full: bool,
    /// Every requested kind.
    pub caches: Vec<CacheKindOutput>,
}

impl CommandOutput for ShowCacheOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![format!("Cache directory: {}", self.cache_dir.display())];
        for cache in &self.caches {
            lines.push(format!(
                "\n{} (hash: {})",
                cache.kind,
                cache.hash.as_deref().unwrap_or("none")
            ));
            if cache.clusters.is_empty() {
                lines.push("  (empty)".to_string());
            }
            for (cluster_id, content) in &cache.clusters {
                if self.full {
                    let body = serde_json::to_string_pretty(content).unwrap_or_default();
                    lines.push(format!("  cluster {cluster_id}:"));
                    lines.extend(body.lines().map(|l| format!("    {l}")));
                } else {
                    lines.push(format!("  cluster {cluster_id}: {}", summarize(content)));
                }
            }
        }
        lines.join("\n")
    }
}

fn summarize(content: &Value) -> String {
    match content {
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("{} key(s) [{}]", keys.len(), keys.join(", "))
        }
        Value::Array(items) => format!("{} item(s)", items.len()),
        other => other.to_string(),
    }
}

/// Read the caches under `cache_dir`, optionally a single kind.
pub fn collect(cache_dir: &Path, kind: Option<CacheKind>, full: bool) -> ShowCacheOutput {
    let family = CacheFamily::open(cache_dir);
    let kinds: Vec<CacheKind> = kind.map_or_else(|| CacheKind::ALL.to_vec(), |k| vec![k]);
    let caches = kinds
        .into_iter()
        .map(|kind| {
            let cache = family.get(kind);
            CacheKindOutput {
                kind: kind.as_str().to_string(),
                hash: cache.hash(),
                clusters: cache
                    .snapshot()
                    .iter()
                    .map(|(id, value)| (id.clone(), Value::clone(value)))
                    .collect(),
            }
        })
        .collect();
    ShowCacheOutput {
        cache_dir: cache_dir.to_path_buf(),
        full,
        caches,
    }
}

/// Print the caches found on disk.
pub async fn execute(args: ShowCacheArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let kind = args
        .kind
        .as_deref()
        .map(|raw| CacheKind::parse(raw).with_context(|| format!("unknown cache kind '{raw}'")))
        .transpose()?;

    let cache_dir = match args.dir {
        Some(dir) => dir,
        None => ConfigLoader::load(config_path)?.paths.cache_dir,
    };

    output(&collect(&cache_dir, kind, args.full), json_mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collect_reads_persisted_caches() {
        let dir = tempfile::tempdir().unwrap();
        let family = CacheFamily::open(dir.path());
        family
            .topology
            .rewrite(
                [("1".to_string(), json!({"hosts": [], "components": []}))].into(),
                Some("abc".into()),
            )
            .unwrap();

        let out = collect(dir.path(), Some(CacheKind::Topology), false);
        assert_eq!(out.caches.len(), 1);
        assert_eq!(out.caches[0].hash.as_deref(), Some("abc"));
        assert!(out.to_human().contains("cluster 1: 2 key(s) [components, hosts]"));

        let all = collect(dir.path(), None, true);
        assert_eq!(all.caches.len(), CacheKind::ALL.len());
        assert!(all.to_human().contains("metadata (hash: none)"));
    }
}
