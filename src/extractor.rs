//! Runs `yt-dlp` and turns its output into a finished file in the output
//! directory.
//!
//! The tool writes into `<output>/.staging/<id>/`. Only once it exits
//! successfully is the produced file renamed to `<output>/<id>.<ext>`, so the
//! retention sweeper never sees a partially written file.

use std::{
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use serde::Deserialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::settings::Settings;

/// `--print` template emitting one JSON line once the file reached its final
/// name.
const PRINT_TEMPLATE: &str = "after_move:%(.{title,duration,filepath})j";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("yt-dlp was not found at {0:?}")]
    ToolMissing(PathBuf),

    #[error("could not run yt-dlp: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("yt-dlp did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    ToolFailed(String),

    #[error("yt-dlp output could not be parsed")]
    MalformedOutput,

    #[error("output file not found")]
    OutputMissing,

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("extraction task stopped unexpectedly")]
    Aborted,
}

impl ExtractionError {
    fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { context, source }
    }
}

/// A validated extraction order.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub url: String,
    pub format: String,
    /// Target bitrate in kbps, `0` for best available.
    pub bitrate: u32,
    pub cookies: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractedAudio {
    pub filename: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub title: Option<String>,
    pub duration: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct PrintedInfo {
    title: Option<String>,
    duration: Option<f64>,
    filepath: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    binary: PathBuf,
    output_dir: PathBuf,
    staging_dir: PathBuf,
    timeout: Option<Duration>,
}

impl Extractor {
    pub fn new(
        binary: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            binary: binary.into(),
            output_dir: output_dir.into(),
            staging_dir: staging_dir.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.ytdlp_binary.clone(),
            settings.output_dir.clone(),
            settings.staging_dir(),
            settings.extraction_timeout,
        )
    }

    pub async fn extract(&self, job: &ExtractionJob) -> Result<ExtractedAudio, ExtractionError> {
        let id = Uuid::new_v4();
        let job_dir = self.staging_dir.join(id.to_string());
        tokio::fs::create_dir_all(&job_dir)
            .await
            .map_err(ExtractionError::io("could not prepare staging directory"))?;

        let result = self.extract_in(&job_dir, id, job).await;
        remove_staging_dir(&job_dir).await;
        result
    }

    async fn extract_in(
        &self,
        job_dir: &Path,
        id: Uuid,
        job: &ExtractionJob,
    ) -> Result<ExtractedAudio, ExtractionError> {
        let cookies_file = job
            .cookies
            .as_deref()
            .map(|cookies| write_cookies_file(job_dir, cookies))
            .transpose()?;
        if cookies_file.is_some() {
            info!(%id, "Using provided cookies for download");
        }

        let template = job_dir.join(format!("{id}.%(ext)s"));
        let args = build_args(
            job,
            &template,
            cookies_file.as_ref().map(NamedTempFile::path),
        );
        let output = self.run(args).await;
        // The cookie jar only lives as long as the tool run.
        drop(cookies_file);
        let output = output?;

        let printed = parse_printed_info(&output.stdout).ok_or(ExtractionError::MalformedOutput)?;
        let produced = resolve_produced_file(job_dir, &job.format, printed.filepath.as_deref())
            .await?
            .ok_or(ExtractionError::OutputMissing)?;

        let extension = produced
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| job.format.clone());
        let filename = format!("{id}.{extension}");
        let path = self.output_dir.join(&filename);
        tokio::fs::rename(&produced, &path)
            .await
            .map_err(ExtractionError::io("could not move finished file"))?;
        let file_size = tokio::fs::metadata(&path)
            .await
            .map_err(ExtractionError::io("could not read finished file"))?
            .len();

        info!(%filename, file_size, "Extraction finished");

        Ok(ExtractedAudio {
            filename,
            path,
            file_size,
            title: printed.title,
            duration: printed.duration,
        })
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, ExtractionError> {
        debug!(binary = ?self.binary, ?args, "Running yt-dlp");
        let command_future = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match self.timeout {
            Some(limit) => timeout(limit, command_future)
                .await
                .map_err(|_| ExtractionError::TimedOut(limit))?,
            None => command_future.await,
        }
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ExtractionError::ToolMissing(self.binary.clone())
            } else {
                ExtractionError::Spawn(error)
            }
        })?;

        if !output.status.success() {
            let message = run_error_message(&output.stderr)
                .unwrap_or_else(|| format!("yt-dlp exited with {}", output.status));
            warn!(%message, "yt-dlp failed");
            return Err(ExtractionError::ToolFailed(message));
        }

        Ok(output)
    }
}

fn build_args(job: &ExtractionJob, template: &Path, cookies: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
        // Retention counts from when the file was produced, not from the
        // source's upload date.
        "--no-mtime".to_string(),
        "-f".to_string(),
        "bestaudio/best".to_string(),
        "-x".to_string(),
        "--audio-format".to_string(),
        job.format.clone(),
    ];

    if job.bitrate > 0 {
        args.push("--audio-quality".to_string());
        args.push(format!("{}K", job.bitrate));
    }

    args.extend([
        "--no-simulate".to_string(),
        "--print".to_string(),
        PRINT_TEMPLATE.to_string(),
        "-o".to_string(),
        template.to_string_lossy().into_owned(),
    ]);

    if let Some(cookies) = cookies {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }

    args.push("--".to_string());
    args.push(job.url.clone());
    args
}

fn write_cookies_file(job_dir: &Path, cookies: &str) -> Result<NamedTempFile, ExtractionError> {
    let mut file = tempfile::Builder::new()
        .prefix("cookies-")
        .suffix(".txt")
        .tempfile_in(job_dir)
        .map_err(ExtractionError::io("could not create cookies file"))?;
    file.write_all(cookies.as_bytes())
        .and_then(|_| file.flush())
        .map_err(ExtractionError::io("could not write cookies file"))?;
    Ok(file)
}

/// Last stdout line that parses as the printed JSON object.
fn parse_printed_info(stdout: &[u8]) -> Option<PrintedInfo> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<PrintedInfo>(line).ok())
        .next_back()
}

fn run_error_message(stderr: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

/// Finds the produced file inside `job_dir`: the printed path first, then
/// any file carrying the requested extension.
async fn resolve_produced_file(
    job_dir: &Path,
    format: &str,
    printed_path: Option<&str>,
) -> Result<Option<PathBuf>, ExtractionError> {
    let canonical_job_dir = tokio::fs::canonicalize(job_dir)
        .await
        .map_err(ExtractionError::io("could not resolve staging directory"))?;

    if let Some(path_value) = printed_path.filter(|value| *value != "NA") {
        let path = PathBuf::from(path_value);
        let candidate = if path.is_absolute() {
            path
        } else {
            job_dir.join(path)
        };
        if let Some(valid_path) = resolve_candidate(&canonical_job_dir, &candidate).await? {
            return Ok(Some(valid_path));
        }
    }

    let mut entries = tokio::fs::read_dir(job_dir)
        .await
        .map_err(ExtractionError::io("could not list staging directory"))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(ExtractionError::io("could not list staging directory"))?
    {
        let path = entry.path();
        let matches_format = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(format));
        if !matches_format {
            continue;
        }
        if let Some(valid_path) = resolve_candidate(&canonical_job_dir, &path).await? {
            return Ok(Some(valid_path));
        }
    }

    Ok(None)
}

async fn resolve_candidate(
    canonical_job_dir: &Path,
    candidate_path: &Path,
) -> Result<Option<PathBuf>, ExtractionError> {
    let metadata = match tokio::fs::metadata(candidate_path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(ExtractionError::Io {
                context: "could not inspect produced file",
                source: error,
            });
        }
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical_candidate = tokio::fs::canonicalize(candidate_path)
        .await
        .map_err(ExtractionError::io("could not resolve produced file"))?;

    if !canonical_candidate.starts_with(canonical_job_dir) {
        warn!(
            path = ?canonical_candidate,
            "Ignoring produced file outside of its staging directory"
        );
        return Ok(None);
    }

    Ok(Some(canonical_candidate))
}

async fn remove_staging_dir(job_dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(job_dir).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!(path = ?job_dir, "Could not clean staging directory: {error}");
    }
}

/// Removes staging directories left behind by a previous process. Only safe
/// before any extraction has been admitted.
pub async fn purge_staging(staging_dir: &Path) {
    let mut entries = match tokio::fs::read_dir(staging_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open staging directory for cleanup: {error}");
            }
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate staging directory: {error}");
                break;
            }
        };
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_dir())
            .unwrap_or(false);
        let removal = if is_dir {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        if let Err(error) = removal
            && error.kind() != ErrorKind::NotFound
        {
            warn!(path = ?path, "Could not remove leftover staging entry: {error}");
        }
    }
}
