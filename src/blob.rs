//! Azure Blob Storage upload over the REST API.
//!
//! Two credential modes are supported. With a connection string the account
//! key is known, so every request is authorised with a short lived account
//! SAS and a read SAS for the uploaded blob can be handed out. With a
//! pre-issued SAS token the token is appended to every request as is, and no
//! further signed URL can be minted.

use std::{collections::HashMap, path::Path, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Body, StatusCode};
use sha2::Sha256;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    files::content_type_for_filename,
    settings::{BlobCredentials, BlobSettings},
};

const STORAGE_VERSION: &str = "2019-12-12";
const REQUEST_SAS_LIFETIME: Duration = Duration::from_secs(15 * 60);
const MAX_ERROR_BODY_CHARS: usize = 300;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("could not sign request: {0}")]
    Signing(String),

    #[error("could not read local file: {0}")]
    Io(#[from] std::io::Error),

    #[error("request to blob service failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("blob service answered {status}: {message}")]
    Status { status: StatusCode, message: String },
}

/// Parsed `AccountName=...;AccountKey=...` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub account_name: String,
    pub account_key: Vec<u8>,
    pub blob_endpoint: String,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, BlobError> {
        let pairs: HashMap<String, String> = raw
            .split(';')
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                Some((key.trim().to_ascii_lowercase(), value.trim().to_string()))
            })
            .collect();

        let account_name = pairs
            .get("accountname")
            .filter(|value| !value.is_empty())
            .cloned()
            .ok_or_else(|| BlobError::InvalidConnectionString("missing AccountName".into()))?;
        let account_key = pairs
            .get("accountkey")
            .filter(|value| !value.is_empty())
            .ok_or_else(|| BlobError::InvalidConnectionString("missing AccountKey".into()))
            .and_then(|key| {
                STANDARD.decode(key).map_err(|_| {
                    BlobError::InvalidConnectionString("AccountKey is not valid base64".into())
                })
            })?;

        let blob_endpoint = match pairs.get("blobendpoint").filter(|value| !value.is_empty()) {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                let protocol = pairs
                    .get("defaultendpointsprotocol")
                    .map(String::as_str)
                    .unwrap_or("https");
                let suffix = pairs
                    .get("endpointsuffix")
                    .map(String::as_str)
                    .unwrap_or("core.windows.net");
                format!("{protocol}://{account_name}.blob.{suffix}")
            }
        };

        Ok(Self {
            account_name,
            account_key,
            blob_endpoint,
        })
    }
}

fn sign(key: &[u8], string_to_sign: &str) -> Result<String, BlobError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|error| BlobError::Signing(error.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn sas_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Account SAS for the blob service.
pub fn account_sas(
    account: &str,
    key: &[u8],
    permissions: &str,
    resource_types: &str,
    expiry: DateTime<Utc>,
) -> Result<String, BlobError> {
    let expiry = sas_timestamp(expiry);
    let string_to_sign =
        format!("{account}\n{permissions}\nb\n{resource_types}\n\n{expiry}\n\n\n{STORAGE_VERSION}\n");
    let signature = sign(key, &string_to_sign)?;
    Ok(format!(
        "sv={STORAGE_VERSION}&ss=b&srt={resource_types}&sp={permissions}&se={}&sig={}",
        urlencoding::encode(&expiry),
        urlencoding::encode(&signature)
    ))
}

/// Service SAS scoped to a single blob.
pub fn blob_sas(
    account: &str,
    key: &[u8],
    container: &str,
    blob_name: &str,
    permissions: &str,
    expiry: DateTime<Utc>,
) -> Result<String, BlobError> {
    let expiry = sas_timestamp(expiry);
    let canonical_resource = format!("/blob/{account}/{container}/{blob_name}");
    let string_to_sign = [
        permissions,
        "",
        &expiry,
        &canonical_resource,
        "",
        "",
        "",
        STORAGE_VERSION,
        "b",
        "",
        "",
        "",
        "",
        "",
        "",
    ]
    .join("\n");
    let signature = sign(key, &string_to_sign)?;
    Ok(format!(
        "sv={STORAGE_VERSION}&sr=b&sp={permissions}&se={}&sig={}",
        urlencoding::encode(&expiry),
        urlencoding::encode(&signature)
    ))
}

fn encode_blob_path(blob_name: &str) -> String {
    blob_name
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone)]
enum Auth {
    SharedKey { account: String, key: Vec<u8> },
    SasToken(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBlob {
    pub url: String,
    pub sas_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BlobUploader {
    http: reqwest::Client,
    endpoint: String,
    container: String,
    auth: Auth,
    generate_sas: bool,
    sas_permissions: String,
    sas_expiry: Duration,
}

impl BlobUploader {
    /// `Ok(None)` when uploads are disabled or no credential mode is complete.
    pub fn from_settings(
        settings: &BlobSettings,
        http: reqwest::Client,
    ) -> Result<Option<Self>, BlobError> {
        let Some(credentials) = settings.credentials() else {
            return Ok(None);
        };

        let (endpoint, auth) = match credentials {
            BlobCredentials::ConnectionString(raw) => {
                let parsed = ConnectionString::parse(&raw)?;
                (
                    parsed.blob_endpoint,
                    Auth::SharedKey {
                        account: parsed.account_name,
                        key: parsed.account_key,
                    },
                )
            }
            BlobCredentials::SasToken { account_url, token } => {
                if settings.generate_sas {
                    warn!(
                        "AZURE_GENERATE_SAS ignored when using pre-generated SAS credentials (provide a connection string for dynamic SAS)."
                    );
                }
                (
                    account_url.trim_end_matches('/').to_string(),
                    Auth::SasToken(token),
                )
            }
        };

        Ok(Some(Self {
            http,
            endpoint,
            container: settings.container.clone(),
            auth,
            generate_sas: settings.generate_sas,
            sas_permissions: settings.sas_permissions.clone(),
            sas_expiry: settings.sas_expiry,
        }))
    }

    pub fn can_sign(&self) -> bool {
        matches!(self.auth, Auth::SharedKey { .. })
    }

    fn blob_url(&self, blob_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            self.container,
            encode_blob_path(blob_name)
        )
    }

    fn request_token(&self) -> Result<String, BlobError> {
        match &self.auth {
            Auth::SasToken(token) => Ok(token.clone()),
            Auth::SharedKey { account, key } => {
                let expiry = Utc::now()
                    + chrono::Duration::from_std(REQUEST_SAS_LIFETIME)
                        .unwrap_or_else(|_| chrono::Duration::minutes(15));
                account_sas(account, key, "cw", "co", expiry)
            }
        }
    }

    /// Read SAS URL for a blob; `None` unless a connection string is in use
    /// and signed URLs were requested.
    pub fn signed_url(&self, blob_name: &str) -> Result<Option<String>, BlobError> {
        let Auth::SharedKey { account, key } = &self.auth else {
            return Ok(None);
        };
        if !self.generate_sas {
            return Ok(None);
        }
        let expiry = Utc::now()
            + chrono::Duration::from_std(self.sas_expiry)
                .map_err(|error| BlobError::Signing(error.to_string()))?;
        let token = blob_sas(
            account,
            key,
            &self.container,
            blob_name,
            &self.sas_permissions,
            expiry,
        )?;
        Ok(Some(format!("{}?{token}", self.blob_url(blob_name))))
    }

    async fn ensure_container(&self, token: &str) -> Result<(), BlobError> {
        let url = format!(
            "{}/{}?restype=container&{token}",
            self.endpoint, self.container
        );
        let response = self
            .http
            .put(url)
            .header("x-ms-version", STORAGE_VERSION)
            .header("content-length", "0")
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                info!(container = %self.container, "Created blob container");
            }
            StatusCode::CONFLICT => {}
            status => {
                // Tokens scoped to a single container usually cannot create
                // one; the blob upload below reports the real problem.
                debug!(container = %self.container, %status, "Container creation skipped");
            }
        }
        Ok(())
    }

    pub async fn upload(&self, path: &Path, blob_name: &str) -> Result<UploadedBlob, BlobError> {
        let token = self.request_token()?;
        self.ensure_container(&token).await?;

        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        let url = self.blob_url(blob_name);

        let response = self
            .http
            .put(format!("{url}?{token}"))
            .header("x-ms-version", STORAGE_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("content-type", content_type_for_filename(blob_name))
            .header("content-length", length.to_string())
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect();
            return Err(BlobError::Status { status, message });
        }

        info!(blob = %blob_name, size_bytes = length, "Uploaded file to blob storage");

        let sas_url = match self.signed_url(blob_name) {
            Ok(sas_url) => sas_url,
            Err(error) => {
                warn!("Failed to generate SAS: {error}");
                None
            }
        };

        Ok(UploadedBlob { url, sas_url })
    }
}
