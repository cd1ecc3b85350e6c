use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, PathsConfig};
use crate::data;
use crate::embed::EmbeddingProvider;
use crate::error::Result;
use crate::index_store::{self, IndexInfo, IndexSnapshot};
use crate::model::{Incident, SearchHit};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_stale: bool,
    pub last_build_time: Option<String>,
    pub item_count: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<IndexInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Semantic search over the persisted index.
///
/// The loaded index is held as an `Arc` snapshot. A reload builds a new
/// snapshot off to the side and swaps the pointer, so searches already
/// running finish against the snapshot they started with.
pub struct Retriever {
    config: AppConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    /// Serialises rebuilds so two refreshes never write the index at once.
    rebuild: Mutex<()>,
}

impl Retriever {
    pub fn open(config: AppConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let paths = &config.paths;
        if config.search.auto_rebuild && index_store::needs_rebuild(paths, embedder.as_ref()) {
            info!(model = embedder.name(), "index missing, stale or built by another embedder, rebuilding");
            if let Err(err) = index_store::build_index(&config, embedder.as_ref()) {
                warn!(error = %err, "index rebuild failed, continuing with existing index");
            }
        }

        let snapshot = match index_store::load_index(paths) {
            Ok(snapshot) => {
                info!(items = snapshot.len(), "loaded index");
                snapshot
            }
            Err(err) => {
                warn!(error = %err, "no usable index, searches will return nothing");
                IndexSnapshot::default()
            }
        };

        if index_store::is_index_stale(paths) {
            warn!("index is stale, refresh to pick up data changes");
        } else if index_store::embedder_changed(paths, embedder.as_ref()) {
            warn!(
                model = embedder.name(),
                "index was built by another embedder, refresh before searching"
            );
        }

        Self {
            config,
            embedder,
            snapshot: RwLock::new(Arc::new(snapshot)),
            rebuild: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.config.paths
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Current snapshot. Cheap to call; the lock is held only for the clone.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn search(&self, query: &str, k: usize, min_score: f32) -> Result<Vec<SearchHit>> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self.embedder.embed(query)?;
        let raw = snapshot.index.search(&query_vec, k)?;

        let mut dropped = 0usize;
        let hits: Vec<SearchHit> = raw
            .into_iter()
            .filter_map(|(pos, score)| {
                if score < min_score {
                    dropped += 1;
                    return None;
                }
                snapshot
                    .items
                    .get(pos)
                    .map(|item| SearchHit::from_item(item, score))
            })
            .collect();

        if dropped > 0 {
            debug!(dropped, min_score, "filtered low-similarity hits");
        }
        Ok(hits)
    }

    /// KB articles whose title names the root cause of one of the given
    /// incidents in the same application.
    pub fn mapped_kb_articles(&self, incident_ids: &[String]) -> Result<Vec<SearchHit>> {
        if incident_ids.is_empty() {
            return Ok(Vec::new());
        }

        let wanted: HashSet<&str> = incident_ids.iter().map(String::as_str).collect();
        let incidents = data::load_incidents(&self.config.paths.data_dir)?;
        let keys: Vec<(String, String)> = incidents
            .iter()
            .filter(|i| wanted.contains(i.id.as_str()))
            .map(|i| (i.application.clone(), i.root_cause.to_lowercase()))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let kbs = data::load_kb_articles(&self.config.paths.data_dir)?;
        let mut seen = HashSet::new();
        let mut mapped = Vec::new();
        for kb in &kbs {
            let title = kb.title.to_lowercase();
            let matches = keys
                .iter()
                .any(|(app, cause)| *app == kb.application && title.contains(cause.as_str()));
            if matches && seen.insert(kb.id.clone()) {
                mapped.push(SearchHit::mapped_kb(kb));
            }
        }
        Ok(mapped)
    }

    pub fn reload(&self) -> ReloadOutcome {
        match index_store::load_index(&self.config.paths) {
            Ok(fresh) => {
                let items = fresh.len();
                *self.snapshot.write() = Arc::new(fresh);
                info!(items, "index reloaded");
                ReloadOutcome {
                    success: true,
                    message: "Index reloaded successfully".to_string(),
                    info: Some(index_store::index_info(&self.config.paths)),
                }
            }
            Err(err) => {
                warn!(error = %err, "index reload failed, keeping previous index");
                ReloadOutcome {
                    success: false,
                    message: format!("Failed to reload index: {err}"),
                    info: None,
                }
            }
        }
    }

    pub fn validate(&self) -> ValidationReport {
        let info = index_store::index_info(&self.config.paths);
        ValidationReport {
            is_stale: info.is_stale,
            last_build_time: info.last_build_time,
            item_count: self.snapshot().len(),
            message: info.message,
        }
    }

    /// Rebuild from the data files, then swap the new index in.
    pub fn refresh(&self) -> RefreshOutcome {
        let _guard = self.rebuild.lock();
        let started = Instant::now();
        let meta = match index_store::build_index(&self.config, self.embedder.as_ref()) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(error = %err, "index refresh failed");
                return RefreshOutcome {
                    success: false,
                    message: format!("Error refreshing index: {err}"),
                    build_time_seconds: None,
                    item_count: None,
                    last_build_time: None,
                    error: Some(err.to_string()),
                };
            }
        };

        let reload = self.reload();
        if !reload.success {
            return RefreshOutcome {
                success: false,
                message: "Index rebuilt but failed to reload".to_string(),
                build_time_seconds: None,
                item_count: None,
                last_build_time: None,
                error: Some(reload.message),
            };
        }

        let elapsed = started.elapsed().as_secs_f64();
        RefreshOutcome {
            success: true,
            message: "Index rebuilt and reloaded successfully".to_string(),
            build_time_seconds: Some((elapsed * 100.0).round() / 100.0),
            item_count: Some(meta.item_count),
            last_build_time: Some(meta.last_build_time),
            error: None,
        }
    }

    /// One vector per incident, reusing indexed vectors where possible.
    pub fn incident_embeddings(&self, incidents: &[Incident]) -> Result<Vec<Vec<f32>>> {
        let snapshot = self.snapshot();
        let mut out: Vec<Option<Vec<f32>>> = incidents
            .iter()
            .map(|i| snapshot.incident_vector(&i.id).map(<[f32]>::to_vec))
            .collect();

        let missing: Vec<usize> = (0..incidents.len()).filter(|&i| out[i].is_none()).collect();
        if !missing.is_empty() {
            debug!(count = missing.len(), "embedding incidents absent from index");
            let texts: Vec<String> = missing
                .iter()
                .map(|&i| incidents[i].cleaned_description())
                .collect();
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            let vectors = self.embedder.embed_batch(&refs)?;
            for (slot, vector) in missing.into_iter().zip(vectors) {
                out[slot] = Some(vector);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }
}
