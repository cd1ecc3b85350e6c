//! Recurring-incident detection on top of density clustering.

use std::collections::{BTreeMap, HashMap};

use nalgebra::DVector;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::cluster::{cluster_count, dbscan};
use crate::config::ClusterConfig;
use crate::data::value_counts;
use crate::error::{IncidentError, Result};
use crate::model::{Incident, Severity};
use crate::text::{is_stop_word, truncate_with_ellipsis};

/// Below this many incidents clustering is skipped.
pub const MIN_INCIDENTS_FOR_CLUSTERING: usize = 5;
pub const ANOMALY_PATTERN_ID: &str = "ANOMALIES";
const CLUSTER_PREFIX: &str = "CLUSTER-";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Representative {
    pub id: String,
    pub description: String,
    pub resolution: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub description: String,
    pub frequency: usize,
    pub severity: String,
    pub applications: BTreeMap<String, usize>,
    pub incidents: Vec<String>,
    pub representative: Representative,
    pub recommended_action: String,
}

impl Pattern {
    pub fn is_cluster(&self) -> bool {
        self.pattern_id.starts_with(CLUSTER_PREFIX)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterDetails {
    pub cluster_id: String,
    pub size: usize,
    pub incidents: Vec<Incident>,
    pub severity_distribution: BTreeMap<String, usize>,
    pub application_distribution: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct Analysis {
    incidents: Vec<Incident>,
    labels: Option<Vec<Option<usize>>>,
    anomalies: Option<Pattern>,
}

/// Groups incidents into patterns and remembers the last run so individual
/// clusters can be inspected afterwards.
pub struct PatternEngine {
    params: ClusterConfig,
    last: RwLock<Analysis>,
}

impl PatternEngine {
    pub fn new(params: ClusterConfig) -> Self {
        Self {
            params,
            last: RwLock::new(Analysis::default()),
        }
    }

    /// `embeddings[i]` must belong to `incidents[i]`.
    pub fn analyze(&self, incidents: &[Incident], embeddings: &[Vec<f32>]) -> Result<Vec<Pattern>> {
        if incidents.len() < MIN_INCIDENTS_FOR_CLUSTERING {
            *self.last.write() = Analysis {
                incidents: incidents.to_vec(),
                ..Analysis::default()
            };
            return Ok(fallback_patterns(incidents));
        }
        if embeddings.len() != incidents.len() {
            return Err(IncidentError::InvalidArg(format!(
                "{} embeddings for {} incidents",
                embeddings.len(),
                incidents.len()
            )));
        }

        info!(incidents = incidents.len(), "clustering incidents");
        let labels = dbscan(embeddings, &self.params);

        let mut patterns = Vec::new();
        for cluster in 0..cluster_count(&labels) {
            let members: Vec<usize> = member_positions(&labels, Some(cluster));
            patterns.push(cluster_pattern(cluster, &members, incidents, embeddings));
        }
        let clusters = patterns.len();

        let noise = member_positions(&labels, None);
        let anomalies = (!noise.is_empty()).then(|| anomaly_pattern(&noise, incidents));
        if let Some(a) = &anomalies {
            patterns.push(a.clone());
        }

        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        info!(patterns = patterns.len(), clusters, "pattern analysis complete");

        *self.last.write() = Analysis {
            incidents: incidents.to_vec(),
            labels: Some(labels),
            anomalies,
        };
        Ok(patterns)
    }

    /// Members of `CLUSTER-<n>` from the last analysis.
    pub fn cluster_details(&self, pattern_id: &str) -> Option<ClusterDetails> {
        let cluster: usize = pattern_id.strip_prefix(CLUSTER_PREFIX)?.parse().ok()?;
        let last = self.last.read();
        let labels = last.labels.as_ref()?;

        let members: Vec<Incident> = member_positions(labels, Some(cluster))
            .into_iter()
            .map(|i| last.incidents[i].clone())
            .collect();
        if members.is_empty() {
            return None;
        }

        Some(ClusterDetails {
            cluster_id: pattern_id.to_string(),
            size: members.len(),
            severity_distribution: value_counts(members.iter().map(|i| i.severity.as_str()))
                .into_iter()
                .collect(),
            application_distribution: value_counts(
                members.iter().map(|i| i.application.as_str()),
            )
            .into_iter()
            .collect(),
            incidents: members,
        })
    }

    pub fn anomalies(&self) -> Option<Pattern> {
        self.last.read().anomalies.clone()
    }
}

fn member_positions(labels: &[Option<usize>], label: Option<usize>) -> Vec<usize> {
    labels
        .iter()
        .enumerate()
        .filter(|(_, l)| **l == label)
        .map(|(i, _)| i)
        .collect()
}

fn top_applications(members: &[&Incident], n: usize) -> BTreeMap<String, usize> {
    value_counts(members.iter().map(|i| i.application.as_str()))
        .into_iter()
        .take(n)
        .collect()
}

fn modal<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    value_counts(values)
        .into_iter()
        .next()
        .map_or_else(|| "Unknown".to_string(), |(v, _)| v)
}

fn cluster_pattern(
    cluster: usize,
    members: &[usize],
    incidents: &[Incident],
    embeddings: &[Vec<f32>],
) -> Pattern {
    let rows: Vec<&Incident> = members.iter().map(|&i| &incidents[i]).collect();
    let app = modal(rows.iter().map(|i| i.application.as_str()));
    let rep = &incidents[closest_to_centroid(members, embeddings)];

    Pattern {
        pattern_id: format!("{CLUSTER_PREFIX}{cluster}"),
        description: describe(&app, &rows),
        frequency: rows.len(),
        severity: average_severity(&rows).as_str().to_string(),
        applications: top_applications(&rows, 3),
        incidents: rows.iter().take(5).map(|i| i.id.clone()).collect(),
        representative: Representative {
            id: rep.id.clone(),
            description: truncate_with_ellipsis(&rep.description, 100),
            resolution: truncate_with_ellipsis(&rep.resolution, 100),
        },
        recommended_action: recommend(&app, &rows),
    }
}

fn describe(app: &str, rows: &[&Incident]) -> String {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let text = rows
        .iter()
        .map(|i| i.description.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    for (order, word) in text
        .split_whitespace()
        .filter(|w| w.chars().count() > 3 && !is_stop_word(w))
        .enumerate()
    {
        counts.entry(word.to_string()).or_insert((0, order)).0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    // most frequent first, earliest occurrence breaks ties
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    let keywords: Vec<String> = ranked.into_iter().take(3).map(|(w, _)| w).collect();

    if keywords.is_empty() {
        format!("Recurring {app} incidents")
    } else {
        format!("Recurring {app} issues related to: {}", keywords.join(", "))
    }
}

fn average_severity(rows: &[&Incident]) -> Severity {
    if rows.is_empty() {
        return Severity::Low;
    }
    let total: f32 = rows
        .iter()
        .map(|i| Severity::parse(&i.severity).map_or(1.0, Severity::weight))
        .sum();
    let avg = total / rows.len() as f32;

    if avg >= 3.5 {
        Severity::Critical
    } else if avg >= 2.5 {
        Severity::High
    } else if avg >= 1.5 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn closest_to_centroid(members: &[usize], embeddings: &[Vec<f32>]) -> usize {
    let dim = embeddings[members[0]].len();
    let vectors: Vec<DVector<f32>> = members
        .iter()
        .map(|&i| DVector::from_column_slice(&embeddings[i]))
        .collect();
    let centroid = vectors
        .iter()
        .fold(DVector::<f32>::zeros(dim), |acc, v| acc + v)
        / members.len() as f32;

    members
        .iter()
        .zip(&vectors)
        .map(|(&i, v)| (i, (v - &centroid).norm()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(members[0], |(i, _)| i)
}

fn recommend(app: &str, rows: &[&Incident]) -> String {
    let modal_severity = modal(rows.iter().map(|i| i.severity.as_str()));
    if rows.len() > 20 {
        format!(
            "High-priority: Investigate root cause for {app} - {} similar incidents",
            rows.len()
        )
    } else if modal_severity == "Critical" || modal_severity == "High" {
        format!("Auto-heal recommended for {app} incidents")
    } else {
        format!("Monitor {app} for pattern escalation")
    }
}

fn anomaly_pattern(noise: &[usize], incidents: &[Incident]) -> Pattern {
    let rows: Vec<&Incident> = noise.iter().map(|&i| &incidents[i]).collect();
    Pattern {
        pattern_id: ANOMALY_PATTERN_ID.to_string(),
        description: "Unusual incidents that don't fit known patterns".to_string(),
        frequency: rows.len(),
        severity: Severity::Medium.as_str().to_string(),
        applications: top_applications(&rows, 3),
        incidents: rows.iter().take(5).map(|i| i.id.clone()).collect(),
        representative: Representative {
            id: "Multiple".to_string(),
            description: "Various unique incidents".to_string(),
            resolution: "Requires individual investigation".to_string(),
        },
        recommended_action: "Review anomalies for new emerging patterns".to_string(),
    }
}

/// Deterministic across runs, unlike `std`'s randomly seeded hasher.
fn stable_hash(s: &str) -> u64 {
    s.bytes().fold(0xcbf29ce484222325, |h, b| {
        (h ^ b as u64).wrapping_mul(0x100000001b3)
    })
}

/// Application frequency patterns for datasets too small to cluster.
pub fn fallback_patterns(incidents: &[Incident]) -> Vec<Pattern> {
    value_counts(incidents.iter().map(|i| i.application.as_str()))
        .into_iter()
        .take(5)
        .map(|(app, count)| Pattern {
            pattern_id: format!("PAT-{}", stable_hash(&app) % 1000),
            description: format!("Frequent {app} issues detected"),
            frequency: count,
            severity: if count > 20 { "High" } else { "Medium" }.to_string(),
            applications: BTreeMap::from([(app.clone(), count)]),
            incidents: Vec::new(),
            representative: Representative {
                id: "N/A".to_string(),
                description: "N/A".to_string(),
                resolution: "N/A".to_string(),
            },
            recommended_action: format!("Auto-heal enabled for {app}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident(id: &str, app: &str, severity: &str, description: &str) -> Incident {
        Incident {
            id: id.into(),
            application: app.into(),
            summary: None,
            description: description.into(),
            severity: severity.into(),
            root_cause: String::new(),
            resolution: format!("Resolved {id}"),
            pattern_id: None,
            created_at: None,
            resolved_at: None,
            time_to_resolve_minutes: None,
            escalated: None,
        }
    }

    fn engine() -> PatternEngine {
        PatternEngine::new(ClusterConfig {
            eps: 0.3,
            min_samples: 3,
            min_cluster_size: 5,
        })
    }

    /// Six VPN incidents around (1, 0), five Email incidents around (0, 1)
    /// and one outlier.
    fn dataset() -> (Vec<Incident>, Vec<Vec<f32>>) {
        let mut incidents = Vec::new();
        let mut vectors = Vec::new();
        for i in 0..6 {
            incidents.push(incident(
                &format!("V{i}"),
                "VPN",
                if i < 4 { "Critical" } else { "High" },
                "VPN tunnel dropped after gateway update",
            ));
            vectors.push(vec![1.0, 0.02 * i as f32]);
        }
        for i in 0..5 {
            incidents.push(incident(
                &format!("E{i}"),
                "Email",
                "Low",
                "Mailbox sync stalled on mobile",
            ));
            vectors.push(vec![0.02 * i as f32, 1.0]);
        }
        incidents.push(incident("X0", "Payroll", "High", "Payslip missing"));
        vectors.push(vec![-1.0, -1.0]);
        (incidents, vectors)
    }

    #[test]
    fn clusters_become_patterns_sorted_by_frequency() {
        let (incidents, vectors) = dataset();
        let patterns = engine().analyze(&incidents, &vectors).unwrap();

        let ids: Vec<&str> = patterns.iter().map(|p| p.pattern_id.as_str()).collect();
        assert_eq!(ids, vec!["CLUSTER-0", "CLUSTER-1", "ANOMALIES"]);

        let vpn = &patterns[0];
        assert_eq!(vpn.frequency, 6);
        assert_eq!(vpn.severity, "Critical");
        assert_eq!(vpn.incidents.len(), 5);
        assert_eq!(vpn.applications.get("VPN"), Some(&6));
        assert_eq!(
            vpn.description,
            "Recurring VPN issues related to: tunnel, dropped, gateway"
        );
        assert_eq!(vpn.recommended_action, "Auto-heal recommended for VPN incidents");
        assert!(vpn.representative.description.ends_with("..."));

        let email = &patterns[1];
        assert_eq!(email.severity, "Low");
        assert_eq!(email.recommended_action, "Monitor Email for pattern escalation");
    }

    #[test]
    fn representative_is_closest_to_centroid() {
        let (incidents, vectors) = dataset();
        let patterns = engine().analyze(&incidents, &vectors).unwrap();
        // VPN members sit at y = 0.00..0.10, centroid y = 0.05
        assert!(matches!(patterns[0].representative.id.as_str(), "V2" | "V3"));
    }

    #[test]
    fn noise_forms_anomaly_pattern() {
        let (incidents, vectors) = dataset();
        let engine = engine();
        engine.analyze(&incidents, &vectors).unwrap();

        let anomalies = engine.anomalies().unwrap();
        assert_eq!(anomalies.frequency, 1);
        assert_eq!(anomalies.incidents, vec!["X0"]);
        assert_eq!(anomalies.representative.id, "Multiple");
    }

    #[test]
    fn cluster_details_from_last_analysis() {
        let (incidents, vectors) = dataset();
        let engine = engine();
        engine.analyze(&incidents, &vectors).unwrap();

        let details = engine.cluster_details("CLUSTER-1").unwrap();
        assert_eq!(details.size, 5);
        assert_eq!(details.application_distribution.get("Email"), Some(&5));
        assert_eq!(details.severity_distribution.get("Low"), Some(&5));

        assert!(engine.cluster_details("CLUSTER-9").is_none());
        assert!(engine.cluster_details("CLUSTER-x").is_none());
        assert!(engine.cluster_details("garbage").is_none());
    }

    #[test]
    fn small_datasets_use_frequency_fallback() {
        let incidents = vec![
            incident("1", "VPN", "High", "a"),
            incident("2", "VPN", "High", "b"),
            incident("3", "Email", "Low", "c"),
        ];
        let engine = engine();
        let patterns = engine.analyze(&incidents, &[]).unwrap();

        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].frequency, 2);
        assert_eq!(patterns[0].severity, "Medium");
        assert_eq!(patterns[0].description, "Frequent VPN issues detected");
        assert!(patterns[0].pattern_id.starts_with("PAT-"));
        assert_eq!(fallback_patterns(&incidents)[0].pattern_id, patterns[0].pattern_id);
        assert!(engine.cluster_details("CLUSTER-0").is_none());
        assert!(engine.anomalies().is_none());
    }

    #[test]
    fn mismatched_embeddings_are_rejected() {
        let (incidents, vectors) = dataset();
        assert!(engine().analyze(&incidents, &vectors[..3]).is_err());
    }
}
