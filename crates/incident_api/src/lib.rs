use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use incident_core::autoheal::DEFAULT_TARGET;
use incident_core::data;
use incident_core::visualization::{available_filters, incident_map, MapFilters};
use incident_core::{
    index_info, load_embedder, AppConfig, AutoHealer, IncidentError, PatternEngine, Retriever,
    SearchHit, SeverityPredictor, SolutionGenerator,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, warn};

pub struct AppState {
    pub config: AppConfig,
    pub retriever: Arc<Retriever>,
    pub patterns: Arc<PatternEngine>,
    pub predictor: Arc<SeverityPredictor>,
    pub solutions: Arc<SolutionGenerator>,
    pub healer: AutoHealer,
}

impl AppState {
    /// Loads the embedder and opens every component. Opening the retriever
    /// may rebuild a stale index, so call this off the async runtime.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let embedder = load_embedder(&config.embedding).context("loading embedding model")?;
        let retriever = Retriever::open(config.clone(), Arc::from(embedder));
        let predictor = SeverityPredictor::open(&config.paths.model_dir);
        if !predictor.is_trained() {
            warn!("severity model not trained, predictions will be unavailable");
        }

        Ok(Self {
            patterns: Arc::new(PatternEngine::new(config.clustering)),
            solutions: Arc::new(SolutionGenerator::from_config(&config.llm)),
            healer: AutoHealer::new(&config.heal),
            retriever: Arc::new(retriever),
            predictor: Arc::new(predictor),
            config,
        })
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Core(IncidentError),
    Internal(String),
}

impl From<IncidentError> for ApiError {
    fn from(err: IncidentError) -> Self {
        Self::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            Self::Core(err) => {
                let status = match &err {
                    IncidentError::InvalidArg(_) => StatusCode::BAD_REQUEST,
                    IncidentError::NotEnoughData(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    IncidentError::IndexUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };
        if status.is_server_error() {
            warn!(%status, error = %message, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs CPU-bound core work on the blocking pool.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> incident_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("worker task failed: {e}")))?
        .map_err(ApiError::from)
}

pub fn router(state: SharedState) -> Router {
    let frontend = state.config.paths.frontend_dir.clone();

    let api = Router::new()
        .route("/health", get(health))
        .route("/api/search", post(search))
        .route("/api/patterns", get(patterns))
        .route("/api/patterns/clusters", get(clusters))
        .route("/api/patterns/clusters/{id}", get(cluster_details))
        .route("/api/patterns/anomalies", get(anomalies))
        .route("/api/heal", post(heal))
        .route("/api/generate-solution", post(generate_solution))
        .route("/api/index/status", get(index_status))
        .route("/api/index/refresh", post(refresh_index))
        .route("/api/visualization/incident-map", get(incident_map_2d))
        .route("/api/visualization/incident-map-3d", get(incident_map_3d))
        .route("/api/visualization/filters", get(visualization_filters))
        .route("/api/predict/severity", post(predict_severity))
        .route("/api/predict/model-info", get(model_info))
        .with_state(state);

    let api = if frontend.is_dir() {
        info!(dir = %frontend.display(), "serving frontend");
        api.fallback_service(ServeDir::new(frontend))
    } else {
        api
    };

    api.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    let info = index_info(state.retriever.paths());
    Json(json!({
        "status": "ok",
        "index_status": {
            "exists": info.exists,
            "is_stale": info.is_stale,
            "item_count": info.item_count.unwrap_or(0),
        }
    }))
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
}

async fn search(
    State(state): State<SharedState>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<Value>> {
    let retriever = state.retriever.clone();
    let search = state.config.search.clone();
    let results = blocking(move || {
        let hits = retriever.search(&req.query, search.top_k, search.min_score)?;
        let mut incidents: Vec<SearchHit> = hits
            .into_iter()
            .filter(|h| h.kind == incident_core::ItemKind::Incident)
            .collect();
        let ids: Vec<String> = incidents.iter().map(|h| h.id.clone()).collect();
        incidents.extend(retriever.mapped_kb_articles(&ids)?);
        Ok(incidents)
    })
    .await?;
    Ok(Json(json!({ "results": results })))
}

async fn analyze(state: &SharedState) -> ApiResult<Vec<incident_core::Pattern>> {
    let retriever = state.retriever.clone();
    let engine = state.patterns.clone();
    let data_dir = state.config.paths.data_dir.clone();
    blocking(move || {
        let incidents = data::load_incidents(&data_dir)?;
        let embeddings = retriever.incident_embeddings(&incidents)?;
        engine.analyze(&incidents, &embeddings)
    })
    .await
}

async fn patterns(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let patterns = analyze(&state).await?;
    Ok(Json(json!({ "patterns": patterns })))
}

async fn clusters(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    let clusters: Vec<_> = analyze(&state)
        .await?
        .into_iter()
        .filter(|p| p.is_cluster())
        .collect();
    Ok(Json(json!({ "total": clusters.len(), "clusters": clusters })))
}

async fn cluster_details(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<incident_core::ClusterDetails>> {
    if let Some(details) = state.patterns.cluster_details(&id) {
        return Ok(Json(details));
    }
    analyze(&state).await?;
    state
        .patterns
        .cluster_details(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Cluster {id} not found")))
}

async fn anomalies(State(state): State<SharedState>) -> ApiResult<Json<Value>> {
    analyze(&state).await?;
    Ok(Json(json!({ "anomalies": state.patterns.anomalies() })))
}

#[derive(Debug, Deserialize)]
pub struct HealRequest {
    pub action: String,
    #[serde(default = "default_target")]
    pub target: String,
}

fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}

async fn heal(
    State(state): State<SharedState>,
    Json(req): Json<HealRequest>,
) -> Json<incident_core::HealResult> {
    Json(state.healer.execute(&req.action, &req.target).await)
}

#[derive(Debug, Deserialize)]
pub struct SolutionRequest {
    pub query: String,
    #[serde(default)]
    pub results: Vec<SearchHit>,
}

async fn generate_solution(
    State(state): State<SharedState>,
    Json(req): Json<SolutionRequest>,
) -> Response {
    let generator = state.solutions.clone();
    let task = tokio::spawn(async move { generator.generate(&req.query, &req.results).await });
    match task.await {
        Ok(solution) => Json(solution).into_response(),
        Err(err) => {
            warn!(error = %err, "solution generation aborted");
            Json(json!({
                "steps": ["Unable to generate AI solution. Please review the supporting evidence manually."],
                "source": "error",
                "metadata": { "error": err.to_string() },
            }))
            .into_response()
        }
    }
}

async fn index_status(State(state): State<SharedState>) -> Json<incident_core::IndexInfo> {
    Json(index_info(state.retriever.paths()))
}

async fn refresh_index(
    State(state): State<SharedState>,
) -> ApiResult<Json<incident_core::RefreshOutcome>> {
    let retriever = state.retriever.clone();
    let outcome = blocking(move || Ok(retriever.refresh())).await?;
    Ok(Json(outcome))
}

async fn render_map(state: &SharedState, dims: u8, filters: MapFilters) -> ApiResult<Response> {
    let retriever = state.retriever.clone();
    let data_dir = state.config.paths.data_dir.clone();
    let map = blocking(move || {
        let incidents = data::load_incidents(&data_dir)?;
        let embeddings = retriever.incident_embeddings(&incidents)?;
        incident_map(&incidents, &embeddings, dims, &filters)
    })
    .await?;
    Ok(Json(map).into_response())
}

async fn incident_map_2d(
    State(state): State<SharedState>,
    Query(filters): Query<MapFilters>,
) -> ApiResult<Response> {
    render_map(&state, 2, filters).await
}

async fn incident_map_3d(State(state): State<SharedState>) -> ApiResult<Response> {
    render_map(&state, 3, MapFilters::default()).await
}

async fn visualization_filters(
    State(state): State<SharedState>,
) -> ApiResult<Json<incident_core::AvailableFilters>> {
    let data_dir = state.config.paths.data_dir.clone();
    let incidents = blocking(move || data::load_incidents(&data_dir)).await?;
    Ok(Json(available_filters(&incidents)))
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub query: String,
}

async fn predict_severity(
    State(state): State<SharedState>,
    Json(req): Json<PredictRequest>,
) -> Response {
    let predictor = state.predictor.clone();
    match blocking(move || predictor.predict(&req.query)).await {
        Ok(prediction) => Json(prediction).into_response(),
        Err(err) => {
            let message = match err {
                ApiError::Core(e) => e.to_string(),
                ApiError::NotFound(m) | ApiError::Internal(m) => m,
            };
            Json(json!({ "error": message, "severity": "Unknown", "confidence": 0.0 })).into_response()
        }
    }
}

async fn model_info(State(state): State<SharedState>) -> Json<incident_core::ModelInfo> {
    Json(state.predictor.model_info())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::fs;
    use tower::ServiceExt;

    const INCIDENTS: &str = "\
incident_id,application,issue_summary,issue_description,severity,root_cause,resolution,pattern_id,created_at
INC00001,VPN,VPN drop,Customer reported: VPN connection failed after update,High,Network configuration,Reset network adapter,1,2024-01-02T10:00:00
INC00002,VPN,VPN drop,Customer reported: VPN connection failed on laptop,High,Network configuration,Reset network adapter,1,2024-01-03T10:00:00
INC00003,Billing,Invoice,Billing system is down with error 500,Critical,Software bug,Restarted server instance,2,2024-01-04T10:00:00
INC00004,Email,Sync,Email not syncing on mobile device,Medium,Cache corruption,Cleared cache,3,2024-01-05T10:00:00
INC00005,Email,Sync,Email not syncing on desktop client,Low,Cache corruption,Reconfigured Outlook profile,3,
";

    const KB: &str = "\
kb_id,application,title,content,tags,created_at
KB0001,VPN,How to resolve Network configuration in VPN,Step 1: Reset network adapter.,vpn,2024-01-01
KB0002,Email,How to resolve Cache corruption in Email,Step 1: Clear the cache.,email,2024-01-01
KB0003,Billing,How to resolve Software bug in Billing,Step 1: Restart the server.,billing,2024-01-01
";

    fn test_state(root: &std::path::Path) -> SharedState {
        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("incidents.csv"), INCIDENTS).unwrap();
        fs::write(data_dir.join("kb_articles.csv"), KB).unwrap();

        let mut config = AppConfig::default();
        config.paths.data_dir = data_dir;
        config.paths.index_dir = root.join("index_store");
        config.paths.model_dir = root.join("models");
        config.paths.frontend_dir = root.join("no-frontend");
        config.embedding.model_path = root.join("missing.safetensors");
        config.embedding.tokenizer_path = root.join("missing-tokenizer.json");
        config.embedding.fallback_dim = 64;
        config.heal.delay_ms = 0;
        config.llm.api_key = None;
        Arc::new(AppState::from_config(config).unwrap())
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_built_index() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body) = call(app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["index_status"]["exists"], true);
        assert_eq!(body["index_status"]["is_stale"], false);
        assert_eq!(body["index_status"]["item_count"], 8);
    }

    #[tokio::test]
    async fn search_lists_incidents_before_mapped_kbs() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body) = call(
            app,
            post_json("/api/search", json!({ "query": "VPN connection failed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let results = body["results"].as_array().unwrap();
        assert_eq!(results[0]["type"], "incident");
        assert_eq!(results[0]["application"], "VPN");
        let first_kb = results.iter().position(|r| r["type"] == "kb").unwrap();
        assert!(results[first_kb..].iter().all(|r| r["type"] == "kb"));
        assert!(results.iter().any(|r| r["id"] == "KB0001"));
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let req = Request::post("/api/search")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn heal_renders_command_for_target() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body) = call(
            app,
            post_json("/api/heal", json!({ "action": "restart_service", "target": "billing" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Success");
        assert_eq!(body["command_executed"], "systemctl restart billing");
    }

    #[tokio::test]
    async fn solution_without_llm_aggregates_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let evidence = json!([{
            "id": "INC00001",
            "type": "incident",
            "resolution": "Reset network adapter",
        }]);
        let (status, body) = call(
            app,
            post_json(
                "/api/generate-solution",
                json!({ "query": "vpn down", "results": evidence }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "aggregated");
        assert!(!body["steps"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn untrained_prediction_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body) = call(
            app.clone(),
            post_json("/api/predict/severity", json!({ "query": "billing down" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["severity"], "Unknown");
        assert!(body["error"].as_str().unwrap().contains("not trained"));

        let (status, info) = call(app, get_req("/api/predict/model-info")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["status"], "not_trained");
    }

    #[tokio::test]
    async fn patterns_cover_every_incident() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body) = call(app.clone(), get_req("/api/patterns")).await;
        assert_eq!(status, StatusCode::OK);
        let covered: usize = body["patterns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["frequency"].as_u64().unwrap() as usize)
            .sum();
        assert_eq!(covered, 5);

        let (status, body) = call(app, get_req("/api/patterns/clusters")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["total"].as_u64().unwrap() as usize,
            body["clusters"].as_array().unwrap().len()
        );
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body) = call(app, get_req("/api/patterns/clusters/CLUSTER-99")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("CLUSTER-99"));
    }

    #[tokio::test]
    async fn refresh_rebuilds_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, body) = call(app.clone(), post_json("/api/index/refresh", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["item_count"], 8);

        let (_, status_body) = call(app, get_req("/api/index/status")).await;
        assert_eq!(status_body["message"], "Index is current");
    }

    #[tokio::test]
    async fn visualization_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let (status, filters) = call(app.clone(), get_req("/api/visualization/filters")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(filters["applications"], json!(["Billing", "Email", "VPN"]));
        assert_eq!(filters["total_incidents"], 5);

        let (status, map) = call(app.clone(), get_req("/api/visualization/incident-map")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(map["coordinates"].as_array().unwrap().len(), 5);
        assert_eq!(map["coordinates"][0].as_array().unwrap().len(), 2);

        let (status, body) = call(
            app,
            get_req("/api/visualization/incident-map?severity=High"),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("Not enough data"));
    }
}
