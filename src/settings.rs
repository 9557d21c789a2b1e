//! Environment driven configuration.
//!
//! Values are read once at startup into an immutable [`Settings`]. A `.env`
//! file in the working directory is honoured (see `main.rs`), but real
//! environment variables always win.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use thiserror::Error;
use url::Url;

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const MAX_SAS_EXPIRY_SECONDS: u64 = 7 * 24 * 60 * 60;

const SAS_PERMISSION_CHARS: &str = "rwdlacuptfmex";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {name} must be an integer, got {value:?}")]
    InvalidInteger { name: &'static str, value: String },

    #[error("Environment variable {name} must be at least {min}, got {value}")]
    TooSmall {
        name: &'static str,
        min: u64,
        value: u64,
    },

    #[error("Environment variable {name} is too large, got {value}")]
    TooLarge { name: &'static str, value: u64 },

    #[error("Invalid Azure SAS permission characters: {0}")]
    InvalidSasPermissions(String),

    #[error("AZURE_SAS_EXPIRY_SECONDS too large (max 604800), got {0}")]
    SasExpiryTooLarge(u64),

    #[error("Invalid origin in ALLOWED_ORIGINS: {0}. Use values like https://example.com")]
    InvalidOrigin(String),
}

/// Quality label to audio bitrate (kbps) lookup. `0` lets the encoder pick
/// the best it can.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualityBitrates(HashMap<String, u32>);

impl QualityBitrates {
    /// Parses `best=0,high=192,...`. Pairs without `=` or with a non numeric
    /// bitrate are skipped.
    pub fn parse(raw: &str) -> Self {
        let map = raw
            .split(',')
            .filter_map(|part| {
                let (label, bitrate) = part.split_once('=')?;
                let label = label.trim().to_ascii_lowercase();
                let bitrate = bitrate.trim().parse::<u32>().ok()?;
                (!label.is_empty()).then_some((label, bitrate))
            })
            .collect();
        Self(map)
    }

    /// Unknown labels fall back to `0` (best).
    pub fn bitrate_for(&self, quality: &str) -> u32 {
        self.0
            .get(&quality.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub enum BlobCredentials {
    /// Full account connection string; can mint signed URLs.
    ConnectionString(String),
    /// Pre-issued SAS token scoped to one account endpoint.
    SasToken { account_url: String, token: String },
}

#[derive(Debug, Clone)]
pub struct BlobSettings {
    pub upload_enabled: bool,
    pub connection_string: Option<String>,
    pub account_url: Option<String>,
    pub sas_token: Option<String>,
    pub container: String,
    pub prefix: String,
    pub generate_sas: bool,
    pub sas_expiry: Duration,
    pub sas_permissions: String,
    pub delete_local_after_upload: bool,
}

impl BlobSettings {
    /// Credentials to use, if the feature is on and either mode is complete.
    /// A connection string takes precedence over an account URL + token.
    pub fn credentials(&self) -> Option<BlobCredentials> {
        if !self.upload_enabled {
            return None;
        }
        if let Some(connection_string) = self.connection_string.clone() {
            return Some(BlobCredentials::ConnectionString(connection_string));
        }
        match (&self.account_url, &self.sas_token) {
            (Some(account_url), Some(token)) => Some(BlobCredentials::SasToken {
                account_url: account_url.clone(),
                token: token.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.credentials().is_some()
    }

    /// Blob name for a produced file, honouring the optional prefix.
    pub fn blob_name(&self, filename: &str) -> String {
        let prefix = self.prefix.trim().trim_matches('/');
        if prefix.is_empty() {
            filename.to_string()
        } else {
            format!("{prefix}/{filename}")
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub ytdlp_binary: PathBuf,
    pub output_dir: PathBuf,
    pub extraction_timeout: Option<Duration>,
    pub default_format: String,
    pub default_quality: String,
    pub allowed_formats: Vec<String>,
    pub allowed_domains: Vec<String>,
    pub max_concurrent_downloads: usize,
    pub quality_bitrates: QualityBitrates,
    pub max_file_age: Duration,
    pub cleanup_interval: Duration,
    pub min_free_disk_mb: u64,
    pub log_level: String,
    pub allowed_origins: Vec<String>,
    pub blob: BlobSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds settings from an arbitrary variable lookup. Tests feed a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| lookup(name).and_then(|value| non_empty(&value).map(String::from));
        let text_or = |name: &str, default: &str| text(name).unwrap_or_else(|| default.to_string());
        let flag = |name: &str| lookup(name).and_then(|value| parse_bool(&value)).unwrap_or(false);

        let max_concurrent_downloads = read_u64(
            &lookup,
            "MAX_CONCURRENT_DOWNLOADS",
            DEFAULT_MAX_CONCURRENT_DOWNLOADS as u64,
        )?;
        ensure_at_least("MAX_CONCURRENT_DOWNLOADS", max_concurrent_downloads, 1)?;
        let cleanup_interval = read_u64(&lookup, "CLEANUP_INTERVAL_SECONDS", 600)?;
        ensure_at_least("CLEANUP_INTERVAL_SECONDS", cleanup_interval, 1)?;
        let max_file_age_hours = read_u64(&lookup, "MAX_FILE_AGE_HOURS", 6)?;
        let max_file_age_secs = max_file_age_hours
            .checked_mul(3600)
            .ok_or(ConfigError::TooLarge {
                name: "MAX_FILE_AGE_HOURS",
                value: max_file_age_hours,
            })?;
        let min_free_disk_mb = read_u64(&lookup, "MIN_FREE_DISK_MB", 100)?;
        let timeout_seconds = read_u64(&lookup, "YT_DLP_TIMEOUT_SECONDS", 0)?;

        let sas_expiry = read_u64(&lookup, "AZURE_SAS_EXPIRY_SECONDS", 3600)?;
        ensure_at_least("AZURE_SAS_EXPIRY_SECONDS", sas_expiry, 1)?;
        if sas_expiry > MAX_SAS_EXPIRY_SECONDS {
            return Err(ConfigError::SasExpiryTooLarge(sas_expiry));
        }
        let sas_permissions = text_or("AZURE_SAS_PERMISSIONS", "r");
        validate_sas_permissions(&sas_permissions)?;

        let blob = BlobSettings {
            upload_enabled: flag("AZURE_UPLOAD_ENABLED"),
            connection_string: text("AZURE_STORAGE_CONNECTION_STRING"),
            account_url: text("AZURE_BLOB_ACCOUNT_URL"),
            sas_token: text("AZURE_SAS_TOKEN")
                .map(|token| token.trim_start_matches('?').trim().to_string())
                .filter(|token| !token.is_empty()),
            container: text_or("AZURE_BLOB_CONTAINER_NAME", "audio-files"),
            prefix: text_or("AZURE_BLOB_PREFIX", ""),
            generate_sas: flag("AZURE_GENERATE_SAS"),
            sas_expiry: Duration::from_secs(sas_expiry),
            sas_permissions,
            delete_local_after_upload: flag("AZURE_DELETE_LOCAL_AFTER_UPLOAD"),
        };

        Ok(Self {
            bind_addr: resolve_bind_addr(&text),
            ytdlp_binary: PathBuf::from(text_or("YT_DLP_BINARY", "yt-dlp")),
            output_dir: PathBuf::from(text_or("YT_DLP_OUTPUT_DIR", "/app/downloads")),
            extraction_timeout: (timeout_seconds > 0).then(|| Duration::from_secs(timeout_seconds)),
            default_format: text_or("DEFAULT_AUDIO_FORMAT", "mp3").to_ascii_lowercase(),
            default_quality: text_or("DEFAULT_AUDIO_QUALITY", "best").to_ascii_lowercase(),
            allowed_formats: split_list(&text_or("ALLOWED_FORMATS", "mp3,m4a,ogg,wav")),
            allowed_domains: split_list(
                &lookup("ALLOWED_DOMAINS").unwrap_or_else(|| "youtube.com,youtu.be".to_string()),
            ),
            max_concurrent_downloads: max_concurrent_downloads as usize,
            quality_bitrates: QualityBitrates::parse(&text_or(
                "QUALITY_BITRATES",
                "best=0,high=192,medium=128,low=64",
            )),
            max_file_age: Duration::from_secs(max_file_age_secs),
            cleanup_interval: Duration::from_secs(cleanup_interval),
            min_free_disk_mb,
            log_level: text_or("LOG_LEVEL", "info").to_ascii_lowercase(),
            allowed_origins: parse_origins(text("ALLOWED_ORIGINS").as_deref())?,
            blob,
        })
    }

    pub fn is_allowed_format(&self, format: &str) -> bool {
        let format = format.trim().to_ascii_lowercase();
        self.allowed_formats.iter().any(|allowed| *allowed == format)
    }

    /// Host suffix match against the allow-list. An empty list allows every
    /// host.
    pub fn is_allowed_host(&self, host: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.allowed_domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
    }

    /// Directory `yt-dlp` writes into before the finished file is moved into
    /// `output_dir`. Hidden so the sweeper skips it.
    pub fn staging_dir(&self) -> PathBuf {
        self.output_dir.join(".staging")
    }
}

fn resolve_bind_addr(text: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = text("APP_ADDR") {
        return configured;
    }

    if let Some(port) = text("PORT").and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_origins(raw: Option<&str>) -> Result<Vec<String>, ConfigError> {
    let mut origins = Vec::new();
    for origin in raw.unwrap_or_default().split(',').map(str::trim) {
        if origin.is_empty() {
            continue;
        }
        let normalized =
            normalize_origin(origin).ok_or_else(|| ConfigError::InvalidOrigin(origin.to_string()))?;
        if !origins.contains(&normalized) {
            origins.push(normalized);
        }
    }
    Ok(origins)
}

/// `scheme://host[:port]` with the default port dropped. Paths, queries and
/// fragments are rejected.
pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https") {
        return None;
    }
    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    // `Url::port` already hides the scheme's default port.
    match parsed.port() {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

fn read_u64<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    // `.env` files in the wild carry trailing comments.
    let value = raw.split('#').next().unwrap_or_default().trim();
    if value.is_empty() {
        return Ok(default);
    }
    value.parse::<u64>().map_err(|_| ConfigError::InvalidInteger {
        name,
        value: value.to_string(),
    })
}

fn ensure_at_least(name: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::TooSmall { name, min, value });
    }
    Ok(())
}

fn validate_sas_permissions(permissions: &str) -> Result<(), ConfigError> {
    let mut invalid = permissions
        .chars()
        .filter(|character| !SAS_PERMISSION_CHARS.contains(*character))
        .collect::<Vec<_>>();
    if invalid.is_empty() {
        return Ok(());
    }
    invalid.sort_unstable();
    invalid.dedup();
    Err(ConfigError::InvalidSasPermissions(
        invalid.into_iter().collect(),
    ))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
