//! Low-dimensional incident maps via Barnes-Hut t-SNE.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::value_counts;
use crate::error::{IncidentError, Result};
use crate::model::{Incident, Severity};
use crate::text::truncate_with_ellipsis;

/// t-SNE needs a few neighbours per point to be meaningful.
pub const MIN_POINTS: usize = 4;
const MAX_PERPLEXITY: f32 = 30.0;
const THETA: f32 = 0.5;
const EPOCHS: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapFilters {
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub application: Option<String>,
}

impl MapFilters {
    fn matches(&self, incident: &Incident) -> bool {
        let accepts = |want: &Option<String>, have: &str| {
            want.as_deref()
                .filter(|w| !w.is_empty())
                .map_or(true, |w| w == have)
        };
        accepts(&self.severity, &incident.severity)
            && accepts(&self.application, &incident.application)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MapMetadata {
    pub incident_ids: Vec<String>,
    pub descriptions: Vec<String>,
    pub summaries: Vec<String>,
    pub severities: Vec<String>,
    pub applications: Vec<String>,
    pub colors: Vec<&'static str>,
    pub created_at: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapStats {
    pub total_incidents: usize,
    pub severity_distribution: BTreeMap<String, usize>,
    pub application_distribution: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentMap {
    pub coordinates: Vec<Vec<f32>>,
    pub metadata: MapMetadata,
    pub filters: MapFilters,
    pub stats: MapStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailableFilters {
    pub severities: Vec<String>,
    pub applications: Vec<String>,
    pub total_incidents: usize,
}

/// Projects the (filtered) incidents to `dims` dimensions.
///
/// `embeddings[i]` belongs to `incidents[i]`.
pub fn incident_map(
    incidents: &[Incident],
    embeddings: &[Vec<f32>],
    dims: u8,
    filters: &MapFilters,
) -> Result<IncidentMap> {
    if !(2..=3).contains(&dims) {
        return Err(IncidentError::InvalidArg(format!(
            "map dimension must be 2 or 3, got {dims}"
        )));
    }
    if embeddings.len() != incidents.len() {
        return Err(IncidentError::InvalidArg(format!(
            "{} embeddings for {} incidents",
            embeddings.len(),
            incidents.len()
        )));
    }

    let (rows, vectors): (Vec<&Incident>, Vec<&[f32]>) = incidents
        .iter()
        .zip(embeddings)
        .filter(|(i, _)| filters.matches(i))
        .map(|(i, v)| (i, v.as_slice()))
        .unzip();

    if rows.len() < MIN_POINTS {
        return Err(IncidentError::NotEnoughData(
            "Not enough data points for visualization".to_string(),
        ));
    }

    let coordinates = project(&vectors, dims);

    Ok(IncidentMap {
        coordinates,
        metadata: MapMetadata {
            incident_ids: rows.iter().map(|i| i.id.clone()).collect(),
            descriptions: rows
                .iter()
                .map(|i| truncate_with_ellipsis(&i.description, 100))
                .collect(),
            summaries: rows
                .iter()
                .map(|i| i.summary.clone().unwrap_or_else(|| i.description.clone()))
                .collect(),
            severities: rows.iter().map(|i| i.severity.clone()).collect(),
            applications: rows.iter().map(|i| i.application.clone()).collect(),
            colors: rows.iter().map(|i| Severity::color(&i.severity)).collect(),
            created_at: rows
                .iter()
                .map(|i| i.created_at.clone().unwrap_or_else(|| "N/A".to_string()))
                .collect(),
        },
        filters: filters.clone(),
        stats: MapStats {
            total_incidents: rows.len(),
            severity_distribution: value_counts(rows.iter().map(|i| i.severity.as_str()))
                .into_iter()
                .collect(),
            application_distribution: value_counts(rows.iter().map(|i| i.application.as_str()))
                .into_iter()
                .collect(),
        },
    })
}

fn project(vectors: &[&[f32]], dims: u8) -> Vec<Vec<f32>> {
    let n = vectors.len();
    let perplexity = MAX_PERPLEXITY.min((n - 1) as f32 / 3.0);
    debug!(points = n, dims, perplexity, "running t-SNE");

    let mut tsne = bhtsne::tSNE::new(vectors);
    tsne.embedding_dim(dims)
        .perplexity(perplexity)
        .epochs(EPOCHS)
        .barnes_hut(THETA, |a, b| {
            a.iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f32>()
                .sqrt()
        });

    tsne.embedding()
        .chunks(usize::from(dims))
        .map(<[f32]>::to_vec)
        .collect()
}

pub fn available_filters(incidents: &[Incident]) -> AvailableFilters {
    let severities: BTreeSet<&str> = incidents.iter().map(|i| i.severity.as_str()).collect();
    let applications: BTreeSet<&str> = incidents.iter().map(|i| i.application.as_str()).collect();
    AvailableFilters {
        severities: severities.into_iter().map(str::to_string).collect(),
        applications: applications.into_iter().map(str::to_string).collect(),
        total_incidents: incidents.len(),
    }
}
