pub mod autoheal;
pub mod cluster;
pub mod config;
pub mod data;
pub mod embed;
pub mod error;
pub mod eval;
pub mod gbdt;
pub mod index_store;
pub mod minilm_embed;
pub mod model;
pub mod patterns;
pub mod retrieval;
pub mod severity;
pub mod solution;
pub mod storage;
pub mod text;
pub mod tfidf;
pub mod vector_index;
pub mod visualization;

pub use autoheal::{AutoHealer, HealResult};
pub use config::AppConfig;
pub use data::DataReport;
pub use embed::{load_embedder, EmbeddingProvider, HashEmbeddingProvider};
pub use error::{IncidentError, Result};
pub use index_store::{build_index, index_info, is_index_stale, IndexInfo, IndexMetadata};
pub use minilm_embed::MiniLmEmbeddingProvider;
pub use model::{Incident, IndexItem, ItemKind, KbArticle, SearchHit, Severity};
pub use patterns::{ClusterDetails, Pattern, PatternEngine};
pub use retrieval::{RefreshOutcome, ReloadOutcome, Retriever, ValidationReport};
pub use severity::{ModelInfo, Prediction, SeverityPredictor, TrainReport};
pub use solution::{GeminiClient, LlmClient, Solution, SolutionGenerator};
pub use visualization::{available_filters, incident_map, AvailableFilters, IncidentMap, MapFilters};
