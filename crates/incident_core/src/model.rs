use serde::{Deserialize, Serialize};

use crate::text::clean_text;

/// One row of `incidents.csv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    #[serde(rename = "incident_id")]
    pub id: String,
    #[serde(default)]
    pub application: String,
    #[serde(rename = "issue_summary", default)]
    pub summary: Option<String>,
    #[serde(rename = "issue_description", default)]
    pub description: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub pattern_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<String>,
    #[serde(default)]
    pub time_to_resolve_minutes: Option<f64>,
    #[serde(default)]
    pub escalated: Option<u8>,
}

impl Incident {
    pub fn cleaned_description(&self) -> String {
        clean_text(&self.description)
    }
}

/// One row of `kb_articles.csv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbArticle {
    #[serde(rename = "kb_id")]
    pub id: String,
    #[serde(default)]
    pub application: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl KbArticle {
    pub fn full_text(&self) -> String {
        format!("{} {}", self.title, self.content)
    }

    pub fn cleaned_text(&self) -> String {
        clean_text(&self.full_text())
    }
}

/// One row of `patterns.csv`. Older datasets only carry a subset of columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub pattern_id: String,
    #[serde(default)]
    pub pattern_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub frequency: Option<u32>,
    #[serde(default)]
    pub affected_applications: Option<String>,
    #[serde(default, alias = "root_cause")]
    pub common_root_cause: Option<String>,
    #[serde(default)]
    pub recommended_action: Option<String>,
}

/// One row of `autoheal_logs.csv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutohealLog {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub incident_id: Option<String>,
    #[serde(default)]
    pub pattern_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub success: Option<u8>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Low" => Some(Self::Low),
            "Medium" => Some(Self::Medium),
            "High" => Some(Self::High),
            "Critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    /// Ordinal weight used when averaging severities (Low = 1 .. Critical = 4).
    pub fn weight(self) -> f32 {
        (self.index() + 1) as f32
    }

    pub fn color(s: &str) -> &'static str {
        match Self::parse(s) {
            Some(Self::Low) => "#4CAF50",
            Some(Self::Medium) => "#FFC107",
            Some(Self::High) => "#FF9800",
            Some(Self::Critical) => "#F44336",
            None => "#9E9E9E",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Incident,
    Kb,
}

/// Metadata stored next to each vector in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub application: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

impl IndexItem {
    pub fn from_incident(incident: &Incident) -> Self {
        Self {
            kind: ItemKind::Incident,
            id: incident.id.clone(),
            text: incident.description.clone(),
            resolution: incident.resolution.clone(),
            severity: incident.severity.clone(),
            application: incident.application.clone(),
            title: String::new(),
            content: String::new(),
        }
    }

    pub fn from_kb(kb: &KbArticle) -> Self {
        Self {
            kind: ItemKind::Kb,
            id: kb.id.clone(),
            text: String::new(),
            resolution: String::new(),
            severity: String::new(),
            application: kb.application.clone(),
            title: kb.title.clone(),
            content: kb.content.clone(),
        }
    }
}

/// A search result as returned to clients. Also accepted back as evidence
/// for solution generation, so every field but `type` is optional on input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub application: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

impl SearchHit {
    pub fn from_item(item: &IndexItem, score: f32) -> Self {
        Self {
            id: item.id.clone(),
            kind: item.kind,
            text: item.text.clone(),
            resolution: item.resolution.clone(),
            content: item.content.clone(),
            title: item.title.clone(),
            application: item.application.clone(),
            severity: item.severity.clone(),
            score,
            distance: Some(1.0 - score),
        }
    }

    pub fn mapped_kb(kb: &KbArticle) -> Self {
        Self {
            id: kb.id.clone(),
            kind: ItemKind::Kb,
            text: kb.full_text(),
            resolution: String::new(),
            content: kb.content.clone(),
            title: kb.title.clone(),
            application: kb.application.clone(),
            severity: String::new(),
            score: 1.0,
            distance: None,
        }
    }
}
