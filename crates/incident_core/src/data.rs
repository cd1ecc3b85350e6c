use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{IncidentError, Result};
use crate::model::{AutohealLog, Incident, KbArticle, PatternRecord};

pub const INCIDENTS_FILE: &str = "incidents.csv";
pub const KB_ARTICLES_FILE: &str = "kb_articles.csv";
pub const PATTERNS_FILE: &str = "patterns.csv";
pub const AUTOHEAL_LOGS_FILE: &str = "autoheal_logs.csv";

fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Err(IncidentError::MissingFile(path.to_path_buf()));
    }
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_path(path)?;
    let rows = reader
        .deserialize()
        .collect::<std::result::Result<Vec<T>, _>>()?;
    debug!(path = %path.display(), rows = rows.len(), "loaded csv");
    Ok(rows)
}

pub fn load_incidents(data_dir: &Path) -> Result<Vec<Incident>> {
    read_csv(&data_dir.join(INCIDENTS_FILE))
}

pub fn load_kb_articles(data_dir: &Path) -> Result<Vec<KbArticle>> {
    read_csv(&data_dir.join(KB_ARTICLES_FILE))
}

pub fn load_patterns(data_dir: &Path) -> Result<Vec<PatternRecord>> {
    read_csv(&data_dir.join(PATTERNS_FILE))
}

pub fn load_autoheal_logs(data_dir: &Path) -> Result<Vec<AutohealLog>> {
    read_csv(&data_dir.join(AUTOHEAL_LOGS_FILE))
}

/// Count occurrences of each key, most frequent first (ties by key).
pub fn value_counts<'a, I>(values: I) -> Vec<(String, usize)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    let mut out: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(k, c)| (k.to_string(), c))
        .collect();
    out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct AutohealSummary {
    pub total_attempts: usize,
    pub successful: usize,
    pub success_rate: f64,
}

/// Dataset sanity report: counts, distributions and data-quality checks.
#[derive(Debug, Clone, Serialize)]
pub struct DataReport {
    pub data_dir: PathBuf,
    pub incidents: usize,
    pub kb_articles: usize,
    pub patterns: Option<usize>,
    pub distinct_incident_patterns: usize,
    pub incidents_missing_description: usize,
    pub kb_missing_content: usize,
    pub application_distribution: BTreeMap<String, usize>,
    pub severity_distribution: BTreeMap<String, usize>,
    pub autoheal: Option<AutohealSummary>,
}

impl DataReport {
    /// Incidents and KB articles are required; patterns and auto-heal logs
    /// are reported when present.
    pub fn collect(data_dir: &Path) -> Result<Self> {
        let incidents = load_incidents(data_dir)?;
        let kbs = load_kb_articles(data_dir)?;
        let patterns = optional(load_patterns(data_dir))?;
        let logs = optional(load_autoheal_logs(data_dir))?;

        let distinct_incident_patterns = incidents
            .iter()
            .filter_map(|i| i.pattern_id.as_deref())
            .collect::<BTreeSet<_>>()
            .len();

        let autoheal = logs.map(|logs| {
            let successful = logs.iter().filter(|l| l.success == Some(1)).count();
            let total_attempts = logs.len();
            AutohealSummary {
                total_attempts,
                successful,
                success_rate: if total_attempts == 0 {
                    0.0
                } else {
                    successful as f64 * 100.0 / total_attempts as f64
                },
            }
        });

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            incidents: incidents.len(),
            kb_articles: kbs.len(),
            patterns: patterns.map(|p| p.len()),
            distinct_incident_patterns,
            incidents_missing_description: incidents
                .iter()
                .filter(|i| i.description.trim().is_empty())
                .count(),
            kb_missing_content: kbs.iter().filter(|k| k.content.trim().is_empty()).count(),
            application_distribution: value_counts(
                incidents.iter().map(|i| i.application.as_str()),
            )
            .into_iter()
            .collect(),
            severity_distribution: value_counts(incidents.iter().map(|i| i.severity.as_str()))
                .into_iter()
                .collect(),
            autoheal,
        })
    }
}

fn optional<T>(res: Result<T>) -> Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(IncidentError::MissingFile(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
