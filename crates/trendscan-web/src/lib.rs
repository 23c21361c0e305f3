//! Axum + Askama web front end: search form, ranked results, xlsx download.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use askama::Template;
use axum::{
    extract::{Form, Path as AxumPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};
use trendscan_core::{clamp_result_count, format_duration, parse_keywords, VideoRecord};
use trendscan_pipeline::{ExportRow, PipelineConfig, SearchPipeline};
use trendscan_storage::resolve_static_path;
use uuid::Uuid;

pub const DEFAULT_MAX_RESULTS: usize = 20;
pub const RETAINED_RESULT_SETS: usize = 32;
const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const DOWNLOAD_NAME: &str = "trending_youtube_videos.xlsx";

/// Immutable result snapshots keyed by id. Each search adds one; exports read
/// by id, so a search in progress never changes an export's data.
#[derive(Debug)]
pub struct ResultSessions {
    capacity: usize,
    entries: Mutex<VecDeque<(Uuid, Arc<Vec<VideoRecord>>)>>,
}

impl ResultSessions {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn store(&self, records: Vec<VideoRecord>) -> Uuid {
        let id = Uuid::new_v4();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back((id, Arc::new(records)));
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Vec<VideoRecord>>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|(key, _)| *key == id)
            .map(|(_, records)| records.clone())
    }
}

pub struct AppState {
    pub pipeline: Arc<SearchPipeline>,
    pub sessions: ResultSessions,
}

impl AppState {
    pub fn new(pipeline: SearchPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            sessions: ResultSessions::new(RETAINED_RESULT_SETS),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchForm {
    #[serde(default)]
    keywords: String,
    #[serde(default)]
    max_results: Option<String>,
}

#[derive(Debug, Clone)]
struct VideoRow {
    title: String,
    url: String,
    channel: String,
    views: u64,
    likes: u64,
    comments: u64,
    duration: String,
    date: String,
    has_thumbnail: bool,
    thumbnail_src: String,
}

impl From<&VideoRecord> for VideoRow {
    fn from(record: &VideoRecord) -> Self {
        let local = record.thumbnail.local_path();
        Self {
            title: record.title.clone(),
            url: record.url.clone(),
            channel: record.channel_name.clone(),
            views: record.views,
            likes: record.likes,
            comments: record.comments,
            duration: format_duration(record.duration_seconds),
            date: record.formatted_date.clone(),
            has_thumbnail: local.is_some(),
            thumbnail_src: local.map(|p| format!("/static/{p}")).unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    keywords: String,
    max_results: usize,
    message: String,
}

#[derive(Template)]
#[template(path = "results.html")]
struct ResultsTemplate {
    keywords: String,
    max_results: usize,
    message: String,
    result_id: String,
    videos: Vec<VideoRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/search", post(search_handler))
        .route("/export/{id}", get(export_handler))
        .route("/api/results/{id}", get(results_json_handler))
        .route("/static/{*path}", get(static_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: PipelineConfig, port: u16) -> anyhow::Result<()> {
    let pipeline = SearchPipeline::from_config(&config)?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, static_root = %config.static_root.display(), "web server listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TRENDSCAN_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    serve(PipelineConfig::from_env(), port).await
}

async fn index_handler() -> Response {
    render_html(IndexTemplate {
        keywords: String::new(),
        max_results: DEFAULT_MAX_RESULTS,
        message: String::new(),
    })
}

async fn search_handler(State(state): State<Arc<AppState>>, Form(form): Form<SearchForm>) -> Response {
    let requested = form
        .max_results
        .as_deref()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_RESULTS);
    let keywords = parse_keywords(&form.keywords);
    if keywords.is_empty() {
        return render_html(IndexTemplate {
            keywords: form.keywords,
            max_results: requested,
            message: "Please enter at least one keyword.".to_string(),
        });
    }

    let max_results = clamp_result_count(requested);
    info!(keywords = %form.keywords, max_results, "search initiated");
    let records = state.pipeline.run(&keywords, max_results).await;

    if records.is_empty() {
        info!(keywords = %form.keywords, "no videos found");
        return render_html(ResultsTemplate {
            keywords: form.keywords,
            max_results,
            message: "No videos found for your query. Try different keywords.".to_string(),
            result_id: String::new(),
            videos: Vec::new(),
        });
    }

    let videos = records.iter().map(VideoRow::from).collect();
    let result_id = state.sessions.store(records);
    render_html(ResultsTemplate {
        keywords: form.keywords,
        max_results,
        message: String::new(),
        result_id: result_id.to_string(),
        videos,
    })
}

async fn export_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    let Some(records) = lookup(&state, &id) else {
        return not_found("No data available to download. Please perform a search first.");
    };

    let exporter = state.pipeline.exporter();
    let built = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Vec<u8>>> {
        let file = tempfile::Builder::new()
            .prefix("trendscan-")
            .suffix(".xlsx")
            .tempfile()?;
        let Some(path) = exporter.export(&records, file.path()) else {
            return Ok(None);
        };
        Ok(Some(std::fs::read(path)?))
    })
    .await;

    match built {
        Ok(Ok(Some(bytes))) => (
            [
                (header::CONTENT_TYPE, XLSX_MIME.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{DOWNLOAD_NAME}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Ok(Ok(None)) => server_error(anyhow::anyhow!("Error generating Excel file.")),
        Ok(Err(err)) => server_error(err),
        Err(err) => server_error(err.into()),
    }
}

async fn results_json_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    match lookup(&state, &id) {
        Some(records) => Json(records.iter().map(ExportRow::from_record).collect::<Vec<_>>()).into_response(),
        None => not_found("Unknown result set"),
    }
}

async fn static_handler(State(state): State<Arc<AppState>>, AxumPath(path): AxumPath<String>) -> Response {
    if path.split(['/', '\\']).any(|part| part == "..") {
        return not_found("Not found");
    }
    let file = resolve_static_path(state.pipeline.static_root(), &path);
    match tokio::fs::read(&file).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type_for(&file))], bytes).into_response(),
        Err(_) => not_found("Not found"),
    }
}

fn lookup(state: &AppState, id: &str) -> Option<Arc<Vec<VideoRecord>>> {
    Uuid::parse_str(id).ok().and_then(|id| state.sessions.get(id))
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("css") => "text/css; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Html(message.to_string())).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html("An unexpected error occurred. Please try again later.".to_string()),
    )
        .into_response()
}
