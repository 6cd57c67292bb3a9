//! Atomic multi-namespace checkpoints
//!
//! Every namespace (the engine itself and one per aggregator) has its own
//! directory. A commit writes one bincode part per namespace,
//! `<dir>/<namespace>-<trigger_id>.ckpt`, each through a temp file, fsync and
//! rename. Once all parts are durable the manifest `_latest.json` in the
//! engine directory is replaced the same way; that rename is the commit
//! point. The manifest records the size and SHA-256 digest of every part, so
//! restore can tell a complete checkpoint from a torn one.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregation::AggregatorSnapshot;
use crate::error::{CheckpointError, CheckpointResult};
use crate::source::SourcePosition;
use crate::watermark::WatermarkState;

/// Namespace holding the engine's own state
pub const ENGINE_NAMESPACE: &str = "engine";

/// Commit manifest file name, in the engine directory
pub const MANIFEST_FILE: &str = "_latest.json";

const MANIFEST_VERSION: u32 = 1;
const PART_EXTENSION: &str = "ckpt";
const TMP_SUFFIX: &str = ".tmp";

/// State of the engine namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCheckpoint {
    /// Trigger that produced this checkpoint
    pub trigger_id: u64,
    /// Next offsets to read
    pub source_position: SourcePosition,
    /// Watermark tracker state
    pub watermark: WatermarkState,
}

/// Everything persisted by one commit
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Last committed trigger id
    pub trigger_id: u64,
    /// When the manifest was written
    pub created_at: DateTime<Utc>,
    /// Next offsets to read
    pub source_position: SourcePosition,
    /// Watermark tracker state
    pub watermark: WatermarkState,
    /// Aggregator states keyed by namespace
    pub aggregators: BTreeMap<String, AggregatorSnapshot>,
}

/// Manifest entry for one namespace part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Part file name inside the namespace directory
    pub file: String,
    /// Part length in bytes
    pub size_bytes: u64,
    /// Hex SHA-256 of the part
    pub sha256: String,
}

/// The commit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub trigger_id: u64,
    pub created_at: DateTime<Utc>,
    pub namespaces: BTreeMap<String, ManifestEntry>,
}

/// Statistics about checkpointing
#[derive(Debug, Clone, Default)]
pub struct CheckpointStats {
    /// Total number of checkpoints committed
    pub commits: u64,
    /// Total number of failed commits
    pub commit_failures: u64,
    /// Total number of restores
    pub restores: u64,
    /// Last committed trigger id
    pub last_trigger_id: Option<u64>,
    /// Last commit timestamp
    pub last_commit_time: Option<DateTime<Utc>>,
    /// Last commit duration in milliseconds
    pub last_commit_duration_ms: Option<u64>,
    /// Total bytes written, parts and manifests
    pub total_bytes_written: u64,
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn part_file_name(namespace: &str, trigger_id: u64) -> String {
    format!("{}-{}.{}", namespace, trigger_id, PART_EXTENSION)
}

/// Trigger id of a part file of `namespace`, if `file_name` is one
fn parse_part_file_name(namespace: &str, file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(namespace)?
        .strip_prefix('-')?
        .strip_suffix(PART_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> CheckpointResult<()> {
    let handle = tokio::fs::File::open(dir)
        .await
        .map_err(|e| io_error(dir, e))?;
    handle.sync_all().await.map_err(|e| io_error(dir, e))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> CheckpointResult<()> {
    Ok(())
}

/// Replace `dir/file_name` with `bytes` so readers see the old or the new
/// content, never a mix
async fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> CheckpointResult<()> {
    use tokio::io::AsyncWriteExt;

    let tmp_path = dir.join(format!(".{}{}", file_name, TMP_SUFFIX));
    let final_path = dir.join(file_name);

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| io_error(&tmp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| io_error(&tmp_path, e))?;
    file.sync_all().await.map_err(|e| io_error(&tmp_path, e))?;
    drop(file);

    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(|e| io_error(&final_path, e))?;
    sync_dir(dir).await
}

/// Checkpoint coordinator
///
/// Owns the namespace layout and the commit protocol. It holds no engine
/// state itself; callers hand it a [`Checkpoint`] to persist and get one
/// back from [`restore`](Self::restore).
///
/// ## Example
///
/// ```rust,no_run
/// use processor::state::CheckpointCoordinator;
///
/// # async fn run() -> anyhow::Result<()> {
/// let coordinator = CheckpointCoordinator::new("./out/engine_checkpoints", 5)
///     .with_namespace("global_kpi", "./out/time_kpi_checkpoints")
///     .with_namespace("country_kpi", "./out/country_kpi_checkpoints");
///
/// if let Some(checkpoint) = coordinator.restore().await? {
///     println!("resuming after trigger {}", checkpoint.trigger_id);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CheckpointCoordinator {
    /// Directory of the engine namespace and the manifest
    engine_dir: PathBuf,
    /// Aggregator namespaces and their directories
    namespaces: BTreeMap<String, PathBuf>,
    /// Committed parts to keep per namespace
    max_retained: usize,
    /// Statistics
    stats: Arc<RwLock<CheckpointStats>>,
}

impl CheckpointCoordinator {
    /// Create a coordinator whose engine namespace lives in `engine_dir`
    pub fn new(engine_dir: impl Into<PathBuf>, max_retained: usize) -> Self {
        Self {
            engine_dir: engine_dir.into(),
            namespaces: BTreeMap::new(),
            max_retained: max_retained.max(1),
            stats: Arc::new(RwLock::new(CheckpointStats::default())),
        }
    }

    /// Register an aggregator namespace stored in `dir`
    pub fn with_namespace(mut self, namespace: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.namespaces.insert(namespace.into(), dir.into());
        self
    }

    /// Path of the commit manifest
    pub fn manifest_path(&self) -> PathBuf {
        self.engine_dir.join(MANIFEST_FILE)
    }

    /// Directory of a namespace
    pub fn namespace_dir(&self, namespace: &str) -> Option<&Path> {
        if namespace == ENGINE_NAMESPACE {
            return Some(&self.engine_dir);
        }
        self.namespaces.get(namespace).map(PathBuf::as_path)
    }

    fn all_namespaces(&self) -> impl Iterator<Item = (&str, &Path)> {
        std::iter::once((ENGINE_NAMESPACE, self.engine_dir.as_path()))
            .chain(self.namespaces.iter().map(|(ns, dir)| (ns.as_str(), dir.as_path())))
    }

    /// Current statistics
    pub fn stats(&self) -> CheckpointStats {
        self.stats.read().clone()
    }

    /// Persist a checkpoint atomically
    ///
    /// On error nothing is committed: the previous manifest stays in place
    /// and any parts already written are swept on the next restore.
    pub async fn commit(&self, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let started = Instant::now();
        match self.commit_internal(checkpoint).await {
            Ok(bytes_written) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                {
                    let mut stats = self.stats.write();
                    stats.commits += 1;
                    stats.last_trigger_id = Some(checkpoint.trigger_id);
                    stats.last_commit_time = Some(Utc::now());
                    stats.last_commit_duration_ms = Some(duration_ms);
                    stats.total_bytes_written += bytes_written;
                }
                info!(
                    trigger_id = checkpoint.trigger_id,
                    position = %checkpoint.source_position,
                    bytes = bytes_written,
                    duration_ms,
                    "Checkpoint committed"
                );
                self.apply_retention(checkpoint.trigger_id).await;
                Ok(())
            }
            Err(err) => {
                self.stats.write().commit_failures += 1;
                warn!(trigger_id = checkpoint.trigger_id, error = %err, "Checkpoint commit failed");
                Err(err)
            }
        }
    }

    async fn commit_internal(&self, checkpoint: &Checkpoint) -> CheckpointResult<u64> {
        let engine_part = EngineCheckpoint {
            trigger_id: checkpoint.trigger_id,
            source_position: checkpoint.source_position.clone(),
            watermark: checkpoint.watermark,
        };

        let mut parts: Vec<(&str, &Path, Vec<u8>)> = Vec::with_capacity(1 + self.namespaces.len());
        parts.push((
            ENGINE_NAMESPACE,
            self.engine_dir.as_path(),
            encode(ENGINE_NAMESPACE, &engine_part)?,
        ));
        for (namespace, dir) in &self.namespaces {
            let snapshot = checkpoint.aggregators.get(namespace).ok_or_else(|| {
                CheckpointError::Serialization {
                    namespace: namespace.clone(),
                    reason: "no state supplied for registered namespace".to_string(),
                }
            })?;
            parts.push((namespace.as_str(), dir.as_path(), encode(namespace, snapshot)?));
        }

        let mut bytes_written = 0u64;
        let mut entries = BTreeMap::new();
        for (namespace, dir, bytes) in parts {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error(dir, e))?;
            let file = part_file_name(namespace, checkpoint.trigger_id);
            write_atomic(dir, &file, &bytes).await?;
            debug!(namespace, file = %file, bytes = bytes.len(), "Wrote checkpoint part");

            bytes_written += bytes.len() as u64;
            entries.insert(
                namespace.to_string(),
                ManifestEntry {
                    file,
                    size_bytes: bytes.len() as u64,
                    sha256: digest_hex(&bytes),
                },
            );
        }

        let manifest = CheckpointManifest {
            version: MANIFEST_VERSION,
            trigger_id: checkpoint.trigger_id,
            created_at: checkpoint.created_at,
            namespaces: entries,
        };
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).map_err(|e| CheckpointError::Serialization {
                namespace: ENGINE_NAMESPACE.to_string(),
                reason: e.to_string(),
            })?;
        write_atomic(&self.engine_dir, MANIFEST_FILE, &manifest_bytes).await?;

        Ok(bytes_written + manifest_bytes.len() as u64)
    }

    /// Read the commit manifest, `None` before the first commit
    pub async fn latest_manifest(&self) -> CheckpointResult<Option<CheckpointManifest>> {
        let path = self.manifest_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };
        let manifest: CheckpointManifest =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if manifest.version != MANIFEST_VERSION {
            return Err(CheckpointError::Corrupt {
                path: path.display().to_string(),
                reason: format!("unsupported manifest version {}", manifest.version),
            });
        }
        Ok(Some(manifest))
    }

    /// Read and verify one namespace part of the committed checkpoint
    async fn read_part<T: DeserializeOwned>(
        &self,
        manifest: &CheckpointManifest,
        namespace: &str,
    ) -> CheckpointResult<T> {
        let torn = |reason: String| CheckpointError::Torn {
            trigger_id: manifest.trigger_id,
            namespace: namespace.to_string(),
            reason,
        };

        let dir = self
            .namespace_dir(namespace)
            .ok_or_else(|| torn("namespace is not registered".to_string()))?;
        let entry = manifest
            .namespaces
            .get(namespace)
            .ok_or_else(|| torn("namespace missing from manifest".to_string()))?;

        let path = dir.join(&entry.file);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(torn(format!("part {} is missing", path.display())));
            }
            Err(err) => return Err(io_error(&path, err)),
        };

        if bytes.len() as u64 != entry.size_bytes {
            return Err(torn(format!(
                "part {} has {} bytes, manifest records {}",
                path.display(),
                bytes.len(),
                entry.size_bytes
            )));
        }
        let digest = digest_hex(&bytes);
        if digest != entry.sha256 {
            return Err(torn(format!("digest mismatch for {}", path.display())));
        }

        bincode::deserialize(&bytes).map_err(|e| CheckpointError::Serialization {
            namespace: namespace.to_string(),
            reason: e.to_string(),
        })
    }

    /// Read and verify the last committed checkpoint without touching the
    /// directories
    pub async fn load(&self) -> CheckpointResult<Option<Checkpoint>> {
        let Some(manifest) = self.latest_manifest().await? else {
            return Ok(None);
        };

        let engine: EngineCheckpoint = self.read_part(&manifest, ENGINE_NAMESPACE).await?;
        if engine.trigger_id != manifest.trigger_id {
            return Err(CheckpointError::Torn {
                trigger_id: manifest.trigger_id,
                namespace: ENGINE_NAMESPACE.to_string(),
                reason: format!("part belongs to trigger {}", engine.trigger_id),
            });
        }

        let mut aggregators = BTreeMap::new();
        for namespace in self.namespaces.keys() {
            let snapshot: AggregatorSnapshot = self.read_part(&manifest, namespace).await?;
            aggregators.insert(namespace.clone(), snapshot);
        }
        for namespace in manifest.namespaces.keys() {
            if self.namespace_dir(namespace).is_none() {
                warn!(namespace = %namespace, "Ignoring checkpoint namespace that is no longer registered");
            }
        }

        Ok(Some(Checkpoint {
            trigger_id: manifest.trigger_id,
            created_at: manifest.created_at,
            source_position: engine.source_position,
            watermark: engine.watermark,
            aggregators,
        }))
    }

    /// Restore the last fully committed checkpoint, `None` on first run
    ///
    /// Every registered namespace must be present and intact. Leftovers of an
    /// interrupted commit are removed afterwards.
    pub async fn restore(&self) -> CheckpointResult<Option<Checkpoint>> {
        let Some(checkpoint) = self.load().await? else {
            info!(dir = %self.engine_dir.display(), "No checkpoint found, starting fresh");
            self.sweep_uncommitted(0).await;
            return Ok(None);
        };

        self.sweep_uncommitted(checkpoint.trigger_id).await;
        self.stats.write().restores += 1;

        info!(
            trigger_id = checkpoint.trigger_id,
            position = %checkpoint.source_position,
            watermark = %checkpoint.watermark.watermark,
            "Restored checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Restore a single namespace of the committed checkpoint
    pub async fn restore_namespace<T: DeserializeOwned>(
        &self,
        namespace: &str,
    ) -> CheckpointResult<Option<(u64, T)>> {
        let Some(manifest) = self.latest_manifest().await? else {
            return Ok(None);
        };
        let value = self.read_part(&manifest, namespace).await?;
        Ok(Some((manifest.trigger_id, value)))
    }

    /// List `(trigger_id, path)` of the parts of a namespace, newest first
    async fn list_parts(namespace: &str, dir: &Path) -> std::io::Result<Vec<(u64, PathBuf)>> {
        let mut parts = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(parts),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(id) = file_name
                .to_str()
                .and_then(|name| parse_part_file_name(namespace, name))
            {
                parts.push((id, entry.path()));
            }
        }
        parts.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(parts)
    }

    /// Remove parts newer than the committed trigger and temp files
    async fn sweep_uncommitted(&self, committed_trigger_id: u64) {
        for (namespace, dir) in self.all_namespaces() {
            match Self::list_parts(namespace, dir).await {
                Ok(parts) => {
                    for (id, path) in parts.into_iter().filter(|(id, _)| *id > committed_trigger_id) {
                        debug!(namespace, trigger_id = id, "Removing uncommitted checkpoint part");
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            warn!("Failed to delete checkpoint part {:?}: {}", path, e);
                        }
                    }
                }
                Err(e) => warn!("Failed to list checkpoint directory {:?}: {}", dir, e),
            }

            let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let is_tmp = entry
                    .file_name()
                    .to_str()
                    .map_or(false, |name| name.starts_with('.') && name.ends_with(TMP_SUFFIX));
                if is_tmp {
                    debug!(path = ?entry.path(), "Removing stray checkpoint temp file");
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
    }

    /// Keep the `max_retained` newest committed parts per namespace
    async fn apply_retention(&self, committed_trigger_id: u64) {
        for (namespace, dir) in self.all_namespaces() {
            let parts = match Self::list_parts(namespace, dir).await {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Failed to list checkpoint directory {:?}: {}", dir, e);
                    continue;
                }
            };
            for (id, path) in parts
                .into_iter()
                .filter(|(id, _)| *id <= committed_trigger_id)
                .skip(self.max_retained)
            {
                debug!(namespace, trigger_id = id, "Deleting old checkpoint part");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to delete checkpoint {:?}: {}", path, e);
                }
            }
        }
    }
}

fn encode<T: Serialize>(namespace: &str, value: &T) -> CheckpointResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| CheckpointError::Serialization {
        namespace: namespace.to_string(),
        reason: e.to_string(),
    })
}
