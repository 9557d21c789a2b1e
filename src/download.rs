//! Download orchestration: request validation, admission, extraction and
//! the optional blob upload.

use axum::extract::Multipart;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use url::Url;

use crate::{
    error::ApiError,
    extractor::{ExtractedAudio, ExtractionError, ExtractionJob},
    settings::Settings,
    state::AppState,
};

pub const MAX_COOKIES_BYTES: usize = 64 * 1024;

const MISSING_CREDENTIALS: &str = "Azure upload enabled but missing credentials (provide AZURE_STORAGE_CONNECTION_STRING OR AZURE_BLOB_ACCOUNT_URL + AZURE_SAS_TOKEN)";

/// Raw submission, from a JSON body or a multipart form.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadRequest {
    pub url: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
    pub cookies: Option<String>,
}

/// A request that passed validation and can be admitted.
#[derive(Debug, Clone)]
pub struct ValidatedDownload {
    pub job: ExtractionJob,
    pub quality: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadResponse {
    pub success: bool,
    pub filename: String,
    pub file_size: u64,
    pub duration: Option<f64>,
    pub title: Option<String>,
    pub quality: Option<String>,
    pub blob_uploaded: Option<bool>,
    pub blob_url: Option<String>,
    pub blob_sas_url: Option<String>,
    pub blob_error: Option<String>,
}

#[derive(Debug, Default)]
struct BlobOutcome {
    uploaded: Option<bool>,
    url: Option<String>,
    sas_url: Option<String>,
    error: Option<String>,
}

impl DownloadRequest {
    /// Reads `url`, `format`, `quality` and an optional `cookies_file` upload.
    /// Unknown fields are ignored.
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut request = Self::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|error| ApiError::bad_request(format!("Failed to read multipart: {error}")))?
        {
            let name = field.name().map(ToString::to_string).unwrap_or_default();
            match name.as_str() {
                "url" | "format" | "quality" => {
                    let value = field.text().await.map_err(|error| {
                        ApiError::bad_request(format!("Failed to read field {name}: {error}"))
                    })?;
                    let slot = match name.as_str() {
                        "url" => &mut request.url,
                        "format" => &mut request.format,
                        _ => &mut request.quality,
                    };
                    *slot = Some(value);
                }
                "cookies_file" => {
                    let upload_name = field.file_name().map(ToString::to_string);
                    let data = field.bytes().await.map_err(|error| {
                        ApiError::bad_request(format!("Failed to read cookies file: {error}"))
                    })?;
                    if data.is_empty() {
                        continue;
                    }
                    if data.len() > MAX_COOKIES_BYTES {
                        return Err(ApiError::bad_request("Cookies file too large (>64KB)"));
                    }
                    let text = String::from_utf8(data.to_vec()).map_err(|_| {
                        ApiError::bad_request("Cookies file must be UTF-8 text")
                    })?;
                    info!(file = ?upload_name, "Received cookies file upload");
                    request.cookies = Some(text);
                }
                _ => {}
            }
        }

        Ok(request)
    }

    pub fn validate(self, settings: &Settings) -> Result<ValidatedDownload, ApiError> {
        let url = self
            .url
            .as_deref()
            .and_then(crate::settings::non_empty)
            .ok_or_else(|| ApiError::bad_request("URL is required"))?
            .to_string();
        validate_url(&url, settings)?;

        let format = self
            .format
            .as_deref()
            .and_then(crate::settings::non_empty)
            .unwrap_or(settings.default_format.as_str())
            .to_ascii_lowercase();
        if !settings.is_allowed_format(&format) {
            return Err(ApiError::bad_request(format!(
                "Format not allowed. Allowed: {}",
                settings.allowed_formats.join(", ")
            )));
        }

        let quality = self
            .quality
            .as_deref()
            .and_then(crate::settings::non_empty)
            .unwrap_or(settings.default_quality.as_str())
            .to_ascii_lowercase();
        let bitrate = settings.quality_bitrates.bitrate_for(&quality);

        let cookies = self.cookies.filter(|cookies| !cookies.trim().is_empty());
        if cookies
            .as_ref()
            .is_some_and(|cookies| cookies.len() > MAX_COOKIES_BYTES)
        {
            return Err(ApiError::bad_request("Cookies too large (>64KB)"));
        }

        Ok(ValidatedDownload {
            job: ExtractionJob {
                url,
                format,
                bitrate,
                cookies,
            },
            quality,
        })
    }
}

fn validate_url(raw: &str, settings: &Settings) -> Result<(), ApiError> {
    let parsed = Url::parse(raw).map_err(|_| ApiError::bad_request("Invalid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::bad_request("Invalid URL"));
    }
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ApiError::bad_request("Invalid URL"))?;
    if !settings.is_allowed_host(host) {
        return Err(ApiError::bad_request("URL domain not allowed"));
    }
    Ok(())
}

/// Waits for an admission slot, then extracts and uploads inside a spawned
/// task that owns the slot. Dropping the returned future before admission
/// abandons the request; after admission the work runs to completion.
pub async fn perform_download(
    state: &AppState,
    order: ValidatedDownload,
) -> Result<DownloadResponse, ExtractionError> {
    let permit = state.admission.acquire().await;
    info!(
        url = %order.job.url,
        format = %order.job.format,
        quality = %order.quality,
        in_flight = state.admission.in_flight(),
        "Download admitted"
    );

    let state = state.clone();
    tokio::spawn(async move {
        let _permit = permit;
        let audio = state.extractor.extract(&order.job).await?;
        let blob = upload_outcome(&state, &audio).await;
        Ok::<_, ExtractionError>(DownloadResponse {
            success: true,
            filename: audio.filename,
            file_size: audio.file_size,
            duration: audio.duration,
            title: audio.title,
            quality: Some(order.quality),
            blob_uploaded: blob.uploaded,
            blob_url: blob.url,
            blob_sas_url: blob.sas_url,
            blob_error: blob.error,
        })
    })
    .await
    .map_err(|join_error| {
        error!("Download task failed: {join_error}");
        ExtractionError::Aborted
    })?
}

async fn upload_outcome(state: &AppState, audio: &ExtractedAudio) -> BlobOutcome {
    let blob_settings = &state.settings.blob;
    if !blob_settings.upload_enabled {
        return BlobOutcome::default();
    }

    let Some(uploader) = state.uploader.as_ref() else {
        error!("{MISSING_CREDENTIALS}");
        return BlobOutcome {
            uploaded: Some(false),
            error: Some(MISSING_CREDENTIALS.to_string()),
            ..BlobOutcome::default()
        };
    };

    let blob_name = blob_settings.blob_name(&audio.filename);
    match uploader.upload(&audio.path, &blob_name).await {
        Ok(uploaded) => {
            if blob_settings.delete_local_after_upload {
                match tokio::fs::remove_file(&audio.path).await {
                    Ok(()) => info!(
                        filename = %audio.filename,
                        "Deleted local file after blob upload"
                    ),
                    Err(error) => warn!(
                        filename = %audio.filename,
                        "Failed to delete local file after blob upload: {error}"
                    ),
                }
            }
            BlobOutcome {
                uploaded: Some(true),
                url: Some(uploaded.url),
                sas_url: uploaded.sas_url,
                error: None,
            }
        }
        Err(upload_error) => {
            let message = format!("Azure upload failed: {upload_error}");
            error!("{message}");
            BlobOutcome {
                uploaded: Some(false),
                error: Some(message),
                ..BlobOutcome::default()
            }
        }
    }
}
