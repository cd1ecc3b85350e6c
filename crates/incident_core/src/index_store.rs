//! Index build and staleness tracking.
//!
//! The index lives in two files: the vectors (`iiraf_index.jsonl`) and the
//! build metadata (`index_metadata.json`). Metadata records each monitored
//! data file's modification time at build; the index is stale as soon as any
//! of those files is newer than recorded.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Instant, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AppConfig, PathsConfig};
use crate::data::{self, INCIDENTS_FILE, KB_ARTICLES_FILE, PATTERNS_FILE};
use crate::embed::EmbeddingProvider;
use crate::error::{IncidentError, Result};
use crate::model::{IndexItem, ItemKind};
use crate::storage::{load_json, load_vectors_jsonl, save_json, save_vectors_jsonl, StoredVector};
use crate::vector_index::FlatIpIndex;

pub const INDEX_FILE: &str = "iiraf_index.jsonl";
pub const METADATA_FILE: &str = "index_metadata.json";
pub const INDEX_VERSION: &str = "1.0";

/// Data files whose changes invalidate the index.
pub const MONITORED_FILES: [&str; 3] = [INCIDENTS_FILE, KB_ARTICLES_FILE, PATTERNS_FILE];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub last_build_time: String,
    pub data_file_timestamps: BTreeMap<String, Option<f64>>,
    pub item_count: usize,
    pub index_version: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub dim: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexInfo {
    pub exists: bool,
    pub is_stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_version: Option<String>,
    pub message: String,
}

pub fn index_path(paths: &PathsConfig) -> PathBuf {
    paths.index_dir.join(INDEX_FILE)
}

pub fn metadata_path(paths: &PathsConfig) -> PathBuf {
    paths.index_dir.join(METADATA_FILE)
}

fn modified_secs(path: &Path) -> Option<f64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_secs_f64())
}

/// Modification time of each monitored file, `None` when it does not exist.
pub fn data_file_timestamps(data_dir: &Path) -> BTreeMap<String, Option<f64>> {
    MONITORED_FILES
        .iter()
        .map(|name| (name.to_string(), modified_secs(&data_dir.join(name))))
        .collect()
}

pub fn load_metadata(paths: &PathsConfig) -> Option<IndexMetadata> {
    let path = metadata_path(paths);
    if !path.exists() {
        return None;
    }
    match load_json(&path) {
        Ok(meta) => Some(meta),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable index metadata");
            None
        }
    }
}

pub fn is_index_stale(paths: &PathsConfig) -> bool {
    if !index_path(paths).exists() || !metadata_path(paths).exists() {
        return true;
    }
    let Some(meta) = load_metadata(paths) else {
        return true;
    };
    timestamps_changed(
        &data_file_timestamps(&paths.data_dir),
        &meta.data_file_timestamps,
    )
}

/// True when the index on disk was built by a different embedding model or
/// at a different dimension than `embedder`. Metadata without a recorded
/// model counts as different.
pub fn embedder_changed(paths: &PathsConfig, embedder: &dyn EmbeddingProvider) -> bool {
    let Some(meta) = load_metadata(paths) else {
        return false;
    };
    meta.embedding_model.as_deref() != Some(embedder.name()) || meta.dim != Some(embedder.dim())
}

/// Stale data files or a switched embedder.
pub fn needs_rebuild(paths: &PathsConfig, embedder: &dyn EmbeddingProvider) -> bool {
    is_index_stale(paths) || embedder_changed(paths, embedder)
}

/// True when an existing file is untracked or newer than recorded. Files
/// that are currently missing never count.
fn timestamps_changed(
    current: &BTreeMap<String, Option<f64>>,
    saved: &BTreeMap<String, Option<f64>>,
) -> bool {
    current.iter().any(|(name, ts)| match (ts, saved.get(name).copied().flatten()) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(now), Some(then)) => *now > then,
    })
}

pub fn index_info(paths: &PathsConfig) -> IndexInfo {
    let Some(meta) = load_metadata(paths) else {
        return IndexInfo {
            exists: false,
            is_stale: true,
            last_build_time: None,
            item_count: None,
            index_version: None,
            message: "Index not built yet".to_string(),
        };
    };

    let stale = is_index_stale(paths);
    IndexInfo {
        exists: true,
        is_stale: stale,
        last_build_time: Some(meta.last_build_time),
        item_count: Some(meta.item_count),
        index_version: Some(meta.index_version),
        message: if stale {
            "Index is stale - data files modified".to_string()
        } else {
            "Index is current".to_string()
        },
    }
}

/// Embed every incident and KB article and persist index plus metadata.
pub fn build_index(config: &AppConfig, embedder: &dyn EmbeddingProvider) -> Result<IndexMetadata> {
    let paths = &config.paths;
    if !paths.index_dir.exists() {
        std::fs::create_dir_all(&paths.index_dir)?;
        info!(dir = %paths.index_dir.display(), "created index directory");
    }

    let started = Instant::now();
    let incidents = data::load_incidents(&paths.data_dir)?;
    let kbs = data::load_kb_articles(&paths.data_dir)?;

    let mut items = Vec::with_capacity(incidents.len() + kbs.len());
    let mut corpus = Vec::with_capacity(incidents.len() + kbs.len());
    for incident in &incidents {
        items.push(IndexItem::from_incident(incident));
        corpus.push(incident.cleaned_description());
    }
    for kb in &kbs {
        items.push(IndexItem::from_kb(kb));
        corpus.push(kb.cleaned_text());
    }

    info!(
        items = corpus.len(),
        model = embedder.name(),
        "generating embeddings"
    );
    let texts: Vec<&str> = corpus.iter().map(String::as_str).collect();
    let embeddings = embedder.embed_batch(&texts)?;

    let rows: Vec<StoredVector> = items
        .into_iter()
        .zip(embeddings)
        .map(|(item, embedding)| StoredVector { item, embedding })
        .collect();
    save_vectors_jsonl(&index_path(paths), &rows)?;

    let meta = IndexMetadata {
        last_build_time: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        data_file_timestamps: data_file_timestamps(&paths.data_dir),
        item_count: rows.len(),
        index_version: INDEX_VERSION.to_string(),
        embedding_model: Some(embedder.name().to_string()),
        dim: Some(embedder.dim()),
    };
    save_json(&metadata_path(paths), &meta)?;

    info!(
        items = meta.item_count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        built_at = %meta.last_build_time,
        "index built"
    );
    Ok(meta)
}

/// An immutable, loaded index: item metadata aligned with vector positions.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    pub items: Vec<IndexItem>,
    pub index: FlatIpIndex,
    incident_positions: HashMap<String, usize>,
}

impl IndexSnapshot {
    pub fn from_rows(rows: Vec<StoredVector>) -> Result<Self> {
        let dim = rows.first().map(|r| r.embedding.len()).unwrap_or(0);
        let mut index = FlatIpIndex::new(dim);
        let mut items = Vec::with_capacity(rows.len());
        let mut incident_positions = HashMap::new();

        for row in rows {
            let pos = index.add(&row.embedding)?;
            if row.item.kind == ItemKind::Incident {
                incident_positions.insert(row.item.id.clone(), pos);
            }
            items.push(row.item);
        }

        Ok(Self {
            items,
            index,
            incident_positions,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn incident_vector(&self, id: &str) -> Option<&[f32]> {
        self.incident_positions
            .get(id)
            .and_then(|pos| self.index.vector(*pos))
    }
}

pub fn load_index(paths: &PathsConfig) -> Result<IndexSnapshot> {
    let path = index_path(paths);
    if !path.exists() {
        return Err(IncidentError::IndexUnavailable(format!(
            "{} does not exist",
            path.display()
        )));
    }
    IndexSnapshot::from_rows(load_vectors_jsonl(&path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fixtures::write_dataset;
    use crate::embed::HashEmbeddingProvider;

    fn test_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.data_dir = root.join("data");
        config.paths.index_dir = root.join("index_store");
        config
    }

    fn bump_mtime(path: &Path) {
        let file = std::fs::File::options().append(true).open(path).unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(120);
        file.set_modified(later).unwrap();
    }

    #[test]
    fn missing_index_reports_not_built() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        assert!(is_index_stale(&config.paths));
        let info = index_info(&config.paths);
        assert!(!info.exists);
        assert!(info.is_stale);
        assert_eq!(info.message, "Index not built yet");
    }

    #[test]
    fn build_then_detect_modification() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_dataset(&config.paths.data_dir);

        let meta = build_index(&config, &HashEmbeddingProvider::new(32)).unwrap();
        assert_eq!(meta.item_count, 8);
        assert_eq!(meta.index_version, INDEX_VERSION);
        assert_eq!(meta.dim, Some(32));
        assert!(!is_index_stale(&config.paths));

        let info = index_info(&config.paths);
        assert!(info.exists);
        assert_eq!(info.item_count, Some(8));
        assert_eq!(info.message, "Index is current");

        bump_mtime(&config.paths.data_dir.join(KB_ARTICLES_FILE));
        assert!(is_index_stale(&config.paths));
        assert_eq!(
            index_info(&config.paths).message,
            "Index is stale - data files modified"
        );
    }

    #[test]
    fn deleted_data_file_does_not_make_index_stale() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_dataset(&config.paths.data_dir);
        build_index(&config, &HashEmbeddingProvider::new(16)).unwrap();

        std::fs::remove_file(config.paths.data_dir.join(PATTERNS_FILE)).unwrap();
        assert!(!is_index_stale(&config.paths));
    }

    #[test]
    fn untracked_file_makes_index_stale() {
        let mut current = BTreeMap::new();
        current.insert(PATTERNS_FILE.to_string(), Some(10.0));
        let mut saved = BTreeMap::new();
        saved.insert(PATTERNS_FILE.to_string(), None);
        assert!(timestamps_changed(&current, &saved));
        assert!(timestamps_changed(&current, &BTreeMap::new()));

        saved.insert(PATTERNS_FILE.to_string(), Some(10.0));
        assert!(!timestamps_changed(&current, &saved));
    }

    #[test]
    fn recorded_mtimes_survive_a_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(METADATA_FILE);
        let mut nanos: u32 = 12_345;

        for i in 0..20_000u64 {
            nanos = nanos.wrapping_mul(1_103_515_245).wrapping_add(12_345) % 1_000_000_000;
            let mtime = std::time::Duration::new(1_792_418_996 + i, nanos).as_secs_f64();
            let current: BTreeMap<String, Option<f64>> =
                [(INCIDENTS_FILE.to_string(), Some(mtime))].into_iter().collect();
            let meta = IndexMetadata {
                last_build_time: String::new(),
                data_file_timestamps: current.clone(),
                item_count: 0,
                index_version: INDEX_VERSION.to_string(),
                embedding_model: None,
                dim: None,
            };

            save_json(&path, &meta).unwrap();
            let saved: IndexMetadata = load_json(&path).unwrap();
            assert!(
                !timestamps_changed(&current, &saved.data_file_timestamps),
                "mtime {mtime} came back as {:?}",
                saved.data_file_timestamps[INCIDENTS_FILE]
            );
        }
    }

    #[test]
    fn switching_embedder_requires_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_dataset(&config.paths.data_dir);
        build_index(&config, &HashEmbeddingProvider::new(32)).unwrap();

        assert!(!needs_rebuild(&config.paths, &HashEmbeddingProvider::new(32)));
        assert!(embedder_changed(&config.paths, &HashEmbeddingProvider::new(64)));
        assert!(needs_rebuild(&config.paths, &HashEmbeddingProvider::new(64)));
        // mtimes alone still say current
        assert!(!is_index_stale(&config.paths));

        let mut meta = load_metadata(&config.paths).unwrap();
        meta.embedding_model = Some("minilm".to_string());
        save_json(&metadata_path(&config.paths), &meta).unwrap();
        assert!(needs_rebuild(&config.paths, &HashEmbeddingProvider::new(32)));

        meta.embedding_model = None;
        save_json(&metadata_path(&config.paths), &meta).unwrap();
        assert!(needs_rebuild(&config.paths, &HashEmbeddingProvider::new(32)));
    }

    #[test]
    fn corrupt_metadata_counts_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_dataset(&config.paths.data_dir);
        build_index(&config, &HashEmbeddingProvider::new(16)).unwrap();

        std::fs::write(metadata_path(&config.paths), "{not json").unwrap();
        assert!(is_index_stale(&config.paths));
        assert!(!index_info(&config.paths).exists);
    }

    #[test]
    fn snapshot_orders_incidents_before_kb_articles() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_dataset(&config.paths.data_dir);
        build_index(&config, &HashEmbeddingProvider::new(16)).unwrap();

        let snapshot = load_index(&config.paths).unwrap();
        assert_eq!(snapshot.len(), 8);
        assert_eq!(snapshot.items[0].kind, ItemKind::Incident);
        assert_eq!(snapshot.items[7].kind, ItemKind::Kb);
        assert!(snapshot.incident_vector("INC00003").is_some());
        assert!(snapshot.incident_vector("KB0001").is_none());
    }

    #[test]
    fn loading_without_index_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(matches!(
            load_index(&config.paths),
            Err(IncidentError::IndexUnavailable(_))
        ));
    }
}
