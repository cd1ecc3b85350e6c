//! Resolution-plan generation from retrieved evidence.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::LlmConfig;
use crate::error::{IncidentError, Result};
use crate::model::{ItemKind, SearchHit};

const MAX_STEPS: usize = 5;
const PROMPT_INCIDENTS: usize = 5;
const PROMPT_KB_ARTICLES: usize = 3;

/// A text-completion backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Google Gemini `generateContent` over HTTPS.
pub struct GeminiClient {
    api_key: SecretString,
    model: String,
    endpoint: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: SecretString, config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            api_key,
            model: config.model.clone(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let response = self
            .client
            .post(format!("{}/models/{}:generateContent", self.endpoint, self.model))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(IncidentError::Llm(format!("{status}: {text}")));
        }

        let parsed: GenerateResponse = response.json().await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(IncidentError::Llm("empty response".to_string()));
        }
        Ok(text)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionMetadata {
    pub incident_count: usize,
    pub kb_count: usize,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub steps: Vec<String>,
    pub source: String,
    pub metadata: SolutionMetadata,
}

pub struct SolutionGenerator {
    llm: Option<Arc<dyn LlmClient>>,
}

impl SolutionGenerator {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        let Some(key) = config.api_key.clone() else {
            warn!("GEMINI_API_KEY not set, solutions will aggregate retrieved resolutions");
            return Self::new(None);
        };
        match GeminiClient::new(key, config) {
            Ok(client) => {
                info!(model = %config.model, "LLM solution generator ready");
                Self::new(Some(Arc::new(client)))
            }
            Err(err) => {
                warn!(error = %err, "failed to initialise LLM client, using aggregation");
                Self::new(None)
            }
        }
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Never fails: any LLM problem degrades to the aggregated plan.
    pub async fn generate(&self, query: &str, results: &[SearchHit]) -> Solution {
        let Some(llm) = &self.llm else {
            return fallback_solution(results, None);
        };

        let (incidents, kbs) = split_evidence(results);
        let prompt = build_prompt(query, &incidents, &kbs);
        match llm.generate(&prompt).await {
            Ok(text) => Solution {
                steps: parse_steps(&text),
                source: "ai_generated".to_string(),
                metadata: SolutionMetadata {
                    incident_count: incidents.len(),
                    kb_count: kbs.len(),
                    model: llm.model_name().to_string(),
                    error: None,
                },
            },
            Err(err) => {
                warn!(error = %err, "LLM generation failed, falling back to aggregation");
                fallback_solution(results, Some(err.to_string()))
            }
        }
    }
}

fn split_evidence(results: &[SearchHit]) -> (Vec<&SearchHit>, Vec<&SearchHit>) {
    results.iter().partition(|r| r.kind == ItemKind::Incident)
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

pub fn build_prompt(query: &str, incidents: &[&SearchHit], kbs: &[&SearchHit]) -> String {
    let mut prompt = format!(
        "You are an expert IT incident resolution assistant. A user has reported the following issue:\n\n\
         **User's Issue:**\n{query}\n\n\
         **Context from Similar Incidents:**\n"
    );

    for (n, inc) in incidents.iter().take(PROMPT_INCIDENTS).enumerate() {
        let _ = write!(
            prompt,
            "\n{}. Incident {}: {}",
            n + 1,
            or_default(&inc.id, "N/A"),
            or_default(&inc.resolution, "No resolution provided")
        );
    }

    prompt.push_str("\n\n**Context from Knowledge Base Articles:**\n");
    for (n, kb) in kbs.iter().take(PROMPT_KB_ARTICLES).enumerate() {
        let _ = write!(
            prompt,
            "\n{}. {}: {}",
            n + 1,
            or_default(&kb.title, "Untitled"),
            or_default(&kb.content, "No content")
        );
    }

    prompt.push_str(
        "\n\n**Your Task:**\n\
         Based on the user's issue and the context provided above, generate a clear, step-by-step resolution plan. \n\n\
         **Requirements:**\n\
         1. Synthesize information from multiple sources into a coherent plan\n\
         2. Provide 3-5 specific, actionable steps\n\
         3. Number each step clearly (Step 1, Step 2, etc.)\n\
         4. Be concise but specific\n\
         5. Include relevant commands or technical details where applicable\n\
         6. If steps conflict, choose the most common or reliable approach\n\n\
         **Format your response as:**\n\
         Step 1: [First action]\n\
         Step 2: [Second action]\n\
         Step 3: [Third action]\n\
         ...\n\n\
         Generate the solution now:",
    );
    prompt
}

/// Pull `Step N: ...` or `N: ...` lines out of free text; sentences when
/// there are none. At most five steps.
pub fn parse_steps(text: &str) -> Vec<String> {
    let mut steps: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| {
            line.starts_with("Step ")
                || (line.starts_with(|c: char| c.is_ascii_digit()) && line.contains(':'))
        })
        .map(|line| match line.split_once(':') {
            Some((_, rest)) => rest.trim().to_string(),
            None => line.to_string(),
        })
        .filter(|s| !s.is_empty())
        .collect();

    if steps.is_empty() {
        steps = text
            .split('.')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    steps.truncate(MAX_STEPS);
    steps
}

/// Incident resolutions then KB contents, de-duplicated in order.
pub fn fallback_solution(results: &[SearchHit], error: Option<String>) -> Solution {
    let (incidents, kbs) = split_evidence(results);
    let mut steps: Vec<String> = Vec::new();
    let candidates = incidents
        .iter()
        .map(|i| i.resolution.as_str())
        .chain(kbs.iter().map(|k| k.content.as_str()));
    for step in candidates.filter(|s| !s.is_empty()) {
        if !steps.iter().any(|s| s == step) {
            steps.push(step.to_string());
        }
    }
    steps.truncate(MAX_STEPS);

    Solution {
        steps,
        source: "aggregated".to_string(),
        metadata: SolutionMetadata {
            incident_count: incidents.len(),
            kb_count: kbs.len(),
            model: "fallback".to_string(),
            error,
        },
    }
}
