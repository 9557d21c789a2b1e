use std::{io::ErrorKind, sync::Arc};

use axum::{
    Form, Json, Router,
    body::{Body, Bytes},
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{
        HeaderMap, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    download::{DownloadRequest, DownloadResponse, perform_download},
    error::ApiError,
    files,
    jobs::{DEFAULT_LIST_LIMIT, JobRecord},
    settings::normalize_origin,
    state::AppState,
};

const SERVICE_NAME: &str = "yt-dlp API";

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    limit: Option<usize>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.settings.allowed_origins);

    let router = Router::new()
        .route("/health", get(health))
        .route("/readiness", get(readiness))
        .route("/download", post(download))
        .route("/download/async", post(enqueue_json).get(list_jobs))
        // `form` shadows the job lookup, so a GET there must still read as
        // an unknown job.
        .route("/download/async/form", post(enqueue_form).get(unknown_job))
        .route("/download/async/{job_id}", get(job_status))
        .route("/download/{filename}", get(get_file).delete(delete_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn readiness(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let settings = &state.settings;
    let output_dir = &settings.output_dir;

    tokio::fs::create_dir_all(output_dir).await.map_err(|error| {
        warn!("Readiness: output directory unavailable: {error}");
        ApiError::unavailable(format!("Output directory unavailable: {error}"))
    })?;

    let free_disk_mb = files::free_disk_mb(output_dir).await.map_err(|error| {
        warn!("Readiness: could not read free disk space: {error}");
        ApiError::unavailable(format!("Could not read free disk space: {error}"))
    })?;
    if free_disk_mb < settings.min_free_disk_mb {
        warn!(
            free_disk_mb,
            min_required_mb = settings.min_free_disk_mb,
            "Readiness: insufficient disk space"
        );
        return Err(ApiError::unavailable("Insufficient disk space"));
    }

    files::probe_writable(output_dir).await.map_err(|error| {
        warn!("Readiness: write test failed: {error}");
        ApiError::unavailable(format!("Write test failed: {error}"))
    })?;

    Ok(Json(json!({
        "status": "ready",
        "free_disk_mb": free_disk_mb,
        "min_required_mb": settings.min_free_disk_mb,
        "output_dir": output_dir.to_string_lossy(),
        "concurrency_limit": state.admission.limit(),
        "in_flight": state.admission.in_flight(),
    })))
}

/// JSON bodies, multipart forms and url-encoded forms, told apart by
/// `Content-Type`.
async fn read_submission(state: &AppState, request: Request) -> Result<DownloadRequest, ApiError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
        DownloadRequest::from_multipart(multipart).await
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(mut submission) = Form::<DownloadRequest>::from_request(request, state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
        // Cookies only travel as a file upload in form submissions.
        submission.cookies = None;
        Ok(submission)
    } else {
        let body = Bytes::from_request(request, state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
        parse_json_submission(&body)
    }
}

fn parse_json_submission(body: &[u8]) -> Result<DownloadRequest, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::bad_request("Invalid JSON body"))
}

async fn download(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<DownloadResponse>, ApiError> {
    let order = read_submission(&state, request)
        .await?
        .validate(&state.settings)?;
    let response = perform_download(&state, order).await?;
    Ok(Json(response))
}

async fn enqueue_json(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let order = parse_json_submission(&body)?.validate(&state.settings)?;
    let job_id = state.jobs.enqueue(order).await?;
    Ok(Json(EnqueueResponse {
        job_id,
        status: "pending",
    }))
}

async fn enqueue_form(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let submission = DownloadRequest::from_multipart(multipart).await?;
    if submission
        .url
        .as_deref()
        .is_none_or(|url| url.trim().is_empty())
    {
        return Err(ApiError::bad_request("url field required"));
    }
    let order = submission.validate(&state.settings)?;
    let job_id = state.jobs.enqueue(order).await?;
    Ok(Json(EnqueueResponse {
        job_id,
        status: "pending",
    }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    state
        .jobs
        .get(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Job not found"))
}

async fn unknown_job() -> ApiError {
    ApiError::not_found("Job not found")
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Json<Vec<JobRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Json(state.jobs.list(limit).await)
}

fn checked_filename(filename: &str) -> Result<(), ApiError> {
    if files::is_valid_filename(filename) {
        Ok(())
    } else {
        Err(ApiError::bad_request("Invalid filename pattern"))
    }
}

async fn get_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    checked_filename(&filename)?;
    let path = state.settings.output_dir.join(&filename);

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(error) => {
            return Err(ApiError::internal(format!("Could not open file: {error}")));
        }
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read file metadata: {error}")))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("File not found"));
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(files::content_type_for_filename(&filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&files::build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build download header"))?,
    );

    debug!(%filename, size_bytes = metadata.len(), "Serving file");
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

async fn delete_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    checked_filename(&filename)?;
    let path = state.settings.output_dir.join(&filename);

    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            info!(%filename, "Deleted file on request");
            Ok(Json(json!({ "success": true, "message": "File deleted" })))
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {
            Err(ApiError::not_found("File not found"))
        }
        Err(error) => Err(ApiError::internal(format!(
            "Failed to delete file: {error}"
        ))),
    }
}

fn build_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    let allowed_origins = Arc::new(origins.to_vec());
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(?origin, ?normalized, allowed, "CORS origin check");
            allowed
        }
    });
    info!(origins = ?allowed_origins, "CORS allow-list loaded");

    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers(Any)
            .expose_headers([CONTENT_DISPOSITION]),
    )
}
