//! JSON API over the request log and roster for advisers and recruiters.

pub mod search;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use rbook_core::{RequestColumns, RequestLog, Sheet};
use rbook_reconcile::{
    pending_counts, request_activity, ActionCounts, FieldMapFile, ReconcileConfig,
};
use rbook_storage::{render_csv, SheetSource};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::search::{export_sheet, roster_overview, search_roster, RecruiterColumns, SearchQuery};

pub const CRATE_NAME: &str = "rbook-web";

#[derive(Clone)]
pub struct AppState {
    pub requests: Arc<dyn SheetSource>,
    pub roster: Arc<dyn SheetSource>,
    pub request_columns: RequestColumns,
    pub recruiter_columns: RecruiterColumns,
}

impl AppState {
    pub fn new(requests: Arc<dyn SheetSource>, roster: Arc<dyn SheetSource>) -> Self {
        Self {
            requests,
            roster,
            request_columns: RequestColumns::default(),
            recruiter_columns: RecruiterColumns::default(),
        }
    }

    /// Sources plus any column overrides from the configured field map.
    pub fn from_config(config: &ReconcileConfig) -> anyhow::Result<Self> {
        let (requests, roster) = config.sources()?;
        let mut state = Self::new(Arc::from(requests), Arc::from(roster));
        if let Some(path) = &config.field_map {
            state.request_columns = FieldMapFile::from_path(path)?.request_columns;
            state.recruiter_columns = RecruiterColumns::from_field_map(path)?;
        }
        Ok(state)
    }

    async fn request_log(&self) -> anyhow::Result<RequestLog> {
        let sheet = self
            .requests
            .read()
            .await
            .with_context(|| format!("loading requests from {}", self.requests.describe()))?;
        Ok(RequestLog::from_sheet(sheet, &self.request_columns)?)
    }

    async fn roster_sheet(&self) -> anyhow::Result<Sheet> {
        self.roster
            .read()
            .await
            .with_context(|| format!("loading roster from {}", self.roster.describe()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingResponse {
    pub counts: ActionCounts,
    pub total: usize,
}

#[derive(Debug, Deserialize, Default)]
struct ActivityQuery {
    today: Option<NaiveDate>,
}

#[derive(Debug, Deserialize, Default)]
struct OverviewQuery {
    year: Option<i32>,
}

/// Query-string form of [`SearchQuery`]; list parameters are comma separated.
#[derive(Debug, Deserialize, Default)]
struct SearchParams {
    year_from: Option<i32>,
    year_to: Option<i32>,
    quarters: Option<String>,
    roles: Option<String>,
    keywords: Option<String>,
    min_matches: Option<usize>,
}

impl SearchParams {
    fn query(&self) -> SearchQuery {
        SearchQuery {
            year_from: self.year_from,
            year_to: self.year_to,
            quarters: split_list(self.quarters.as_deref()),
            roles: split_list(self.roles.as_deref()),
            keywords: split_list(self.keywords.as_deref()),
        }
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/pending", get(pending_handler))
        .route("/api/activity", get(activity_handler))
        .route("/api/roster/overview", get(overview_handler))
        .route("/api/roster/search", get(search_handler))
        .route("/api/roster/export.csv", get(export_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RBOOK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = ReconcileConfig::from_env()?;
    serve(AppState::from_config(&config)?, port).await
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving resume book api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn pending_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.request_log().await {
        Ok(log) => {
            let counts = pending_counts(&log);
            Json(PendingResponse {
                total: counts.total(),
                counts,
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn activity_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActivityQuery>,
) -> Response {
    let today = query.today.unwrap_or_else(|| Utc::now().date_naive());
    match state.request_log().await {
        Ok(log) => Json(request_activity(&log, today)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn overview_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OverviewQuery>,
) -> Response {
    let result = async {
        let sheet = state.roster_sheet().await?;
        Ok::<_, anyhow::Error>(roster_overview(&sheet, &state.recruiter_columns, query.year)?)
    }
    .await;
    match result {
        Ok(overview) => Json(overview).into_response(),
        Err(err) => server_error(err),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    let result = async {
        let sheet = state.roster_sheet().await?;
        Ok::<_, anyhow::Error>(search_roster(&sheet, &state.recruiter_columns, &params.query())?)
    }
    .await;
    match result {
        Ok(results) => Json(results).into_response(),
        Err(err) => server_error(err),
    }
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    let min_matches = params.min_matches.unwrap_or(2);
    let result = async {
        let sheet = state.roster_sheet().await?;
        let results = search_roster(&sheet, &state.recruiter_columns, &params.query())?;
        render_csv(&export_sheet(&sheet, &results, min_matches))
    }
    .await;
    match result {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"min_{min_matches}_matches.csv\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use rbook_core::{ADD_FORM_VALUE, REMOVE_FORM_VALUE, UPDATE_FORM_VALUE};
    use rbook_storage::CsvFileSource;
    use tower::ServiceExt;

    const REQUESTS: &str = "\
Timestamp,Email ,Email Address,First Name,Last Name,\"Do you want to add, update, or remove your resume?\",Upload Resume,Done?
10/11/2026 09:30:00,a@x.edu,,Ana,Diaz,ADD,ana.pdf,
10/12/2026 14:00:00,b@x.edu,,Ben,Okafor,UPDATE,ben.pdf,
10/13/2026 08:15:00,c@x.edu,,Cai,Wen,REMOVE,,
10/01/2026 10:00:00,d@x.edu,,Dev,Rao,ADD,dev.pdf,yes
";

    const ROSTER: &str = "\
Email,First Name,Last Name,Grad Year,Grad Quarter,Are you looking for an internship or full-time position?,What types of roles are you looking for?,Resume Full Text
a@x.edu,Ana,Diaz,2026,Spring,Internship,\"Data Science, Product Management\",Python and SQL
b@x.edu,Ben,Okafor,2026,Fall,Full time,Data Science,python visualization
c@x.edu,Cai,Wen,2027,Spring,Both,Product Management,Roadmaps
";

    fn test_app(dir: &tempfile::TempDir) -> Router {
        let requests = REQUESTS
            .replace("ADD", &format!("\"{ADD_FORM_VALUE}\""))
            .replace("UPDATE", &format!("\"{UPDATE_FORM_VALUE}\""))
            .replace("REMOVE", &format!("\"{REMOVE_FORM_VALUE}\""));
        std::fs::write(dir.path().join("requests.csv"), requests).unwrap();
        std::fs::write(dir.path().join("roster.csv"), ROSTER).unwrap();
        app(AppState::new(
            Arc::new(CsvFileSource::new(dir.path().join("requests.csv"))),
            Arc::new(CsvFileSource::new(dir.path().join("roster.csv"))),
        ))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(test_app(&dir), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn pending_counts_skip_done_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(test_app(&dir), "/api/pending").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["counts"]["add"], 1);
        assert_eq!(body["counts"]["update"], 1);
        assert_eq!(body["counts"]["remove"], 1);
        assert_eq!(body["total"], 3);
    }

    #[tokio::test]
    async fn activity_uses_requested_day() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_json(test_app(&dir), "/api/activity?today=2026-10-15").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["weeks"].as_array().unwrap().len(), 3);
        assert_eq!(body["hours"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn overview_and_search_json() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);
        let (status, overview) = get_json(app.clone(), "/api/roster/overview?year=2026").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(overview["records"], 3);
        assert_eq!(overview["quarter_breakdown"]["year"], 2026);
        assert_eq!(overview["roles"].as_array().unwrap().len(), 2);

        let (status, results) = get_json(
            app,
            "/api/roster/search?year_to=2026&roles=Data%20Science&keywords=python,visualization",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(results["filtered"], 2);
        assert_eq!(results["exact_matches"], 1);
        assert_eq!(results["partial_matches"], 1);
    }

    #[tokio::test]
    async fn export_returns_csv() {
        let dir = tempfile::tempdir().unwrap();
        let resp = test_app(&dir)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/roster/export.csv?keywords=python,visualization&min_matches=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/csv; charset=utf-8"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let sheet = rbook_storage::parse_csv(&body).unwrap();
        assert_eq!(sheet.rows.len(), 2);
    }

    #[tokio::test]
    async fn field_map_column_overrides_reach_the_api() {
        let dir = tempfile::tempdir().unwrap();
        let requests = REQUESTS
            .replace(
                "Do you want to add, update, or remove your resume?",
                "What would you like to do?",
            )
            .replace("ADD", &format!("\"{ADD_FORM_VALUE}\""))
            .replace("UPDATE", &format!("\"{UPDATE_FORM_VALUE}\""))
            .replace("REMOVE", &format!("\"{REMOVE_FORM_VALUE}\""));
        std::fs::write(dir.path().join("requests.csv"), requests).unwrap();
        std::fs::write(
            dir.path().join("roster.csv"),
            ROSTER.replace("Resume Full Text", "Resume Text"),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("field_map.yaml"),
            "request_columns:\n  action: \"What would you like to do?\"\n\
             recruiter_columns:\n  resume_text: \"Resume Text\"\n",
        )
        .unwrap();

        let mut config = ReconcileConfig::local(dir.path());
        config.field_map = Some(dir.path().join("field_map.yaml"));
        let app = app(AppState::from_config(&config).unwrap());

        let (status, body) = get_json(app.clone(), "/api/pending").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);

        let (status, results) = get_json(app, "/api/roster/search?keywords=python").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(results["exact_matches"], 2);
    }

    #[tokio::test]
    async fn missing_roster_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(AppState::new(
            Arc::new(CsvFileSource::new(dir.path().join("requests.csv"))),
            Arc::new(CsvFileSource::new(dir.path().join("absent.csv"))),
        ));
        let (status, body) = get_json(app, "/api/roster/overview").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("absent.csv"));
    }
}
