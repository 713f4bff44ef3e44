use std::sync::Arc;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;
use url::Url;

use crate::auth::{AuthError, AuthGate};

/// Server-contracted size of one transfer chunk.
pub const UPLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

const DATA_LIMIT_REACHED: &str = "You have reached a data limit";

#[derive(Debug, Error)]
pub enum MerginError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("server returned {status}: {detail}")]
    Api { status: StatusCode, detail: String },
}

impl MerginError {
    /// The push-start rejection that the presentation layer shows as a modal
    /// dialog instead of a passive notification.
    pub fn is_data_limit(&self) -> bool {
        matches!(
            self,
            MerginError::Api { status, detail }
                if *status == StatusCode::BAD_REQUEST && detail == DATA_LIMIT_REACHED
        )
    }
}

/// Extracts the user-facing message from a server error body. The server
/// reports errors as `{"detail": ...}` where `detail` is a string or an
/// object; anything else is passed through verbatim.
pub(crate) fn extract_error_detail(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(obj)) => match obj.get("detail") {
            Some(serde_json::Value::String(detail)) => detail.clone(),
            Some(detail @ serde_json::Value::Object(_)) => detail.to_string(),
            _ => "[can't parse server error]".to_string(),
        },
        _ => body.to_string(),
    }
}

/// Parses a project version label: either a bare integer or `"v{int}"`.
/// Empty or unparsable labels count as version 0.
pub fn parse_version_label(label: &str) -> i64 {
    let digits = label.strip_prefix('v').unwrap_or(label);
    digits.parse().unwrap_or(0)
}

#[derive(Clone)]
pub struct MerginClient {
    http: Client,
    base_url: Url,
    auth: Arc<AuthGate>,
    chunk_size: u64,
}

impl MerginClient {
    pub fn new(base_url: &str, auth: Arc<AuthGate>) -> Result<Self, MerginError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            auth,
            chunk_size: UPLOAD_CHUNK_SIZE,
        })
    }

    /// Overrides the transfer chunk size. The production value is dictated by
    /// the server contract; smaller sizes let tests exercise multi-chunk
    /// transfers with tiny payloads.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn auth(&self) -> &Arc<AuthGate> {
        &self.auth
    }

    /// Compatibility probe; the only unauthenticated endpoint.
    pub async fn ping(&self) -> Result<PingResponse, MerginError> {
        let url = self.endpoint("/ping")?;
        debug!(url = %url, "ping");
        let response = self.http.get(url).send().await?;
        Self::handle_response(response).await
    }

    pub async fn user_info(&self, username: &str) -> Result<UserInfo, MerginError> {
        let url = self.endpoint(&format!("/v1/user/{username}"))?;
        debug!(url = %url, "get user info");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header().await?)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_projects(
        &self,
        filter: &ProjectListFilter,
    ) -> Result<Vec<ProjectListEntry>, MerginError> {
        let mut url = self.endpoint("/v1/project")?;
        {
            let mut query = url.query_pairs_mut();
            if !filter.tags.is_empty() {
                query.append_pair("tags", &filter.tags);
            }
            if !filter.search.is_empty() {
                query.append_pair("q", &filter.search);
            }
            if !filter.flag.is_empty() {
                query.append_pair("flag", &filter.flag);
                query.append_pair("user", &filter.user);
            }
        }
        debug!(url = %url, "list projects");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header().await?)
            .send()
            .await?;
        let raw: Vec<RawProjectEntry> = Self::handle_response(response).await?;
        Ok(raw.into_iter().map(ProjectListEntry::from).collect())
    }

    /// Fetches project metadata and returns the raw JSON body. The caller
    /// both parses it and persists it verbatim as the baseline cache, so the
    /// bytes are handed over untouched.
    pub async fn project_info(&self, project_full_name: &str) -> Result<Vec<u8>, MerginError> {
        let url = self.endpoint(&format!("/v1/project/{project_full_name}"))?;
        debug!(url = %url, "get project info");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header().await?)
            .send()
            .await?;
        Self::raw_body(response).await
    }

    pub async fn create_project(
        &self,
        namespace: &str,
        name: &str,
        public: bool,
    ) -> Result<(), MerginError> {
        let url = self.endpoint(&format!("/v1/project/{namespace}"))?;
        debug!(url = %url, name, "create project");
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header().await?)
            .json(&serde_json::json!({ "name": name, "public": public }))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    pub async fn delete_project(&self, namespace: &str, name: &str) -> Result<(), MerginError> {
        let url = self.endpoint(&format!("/v1/project/{namespace}/{name}"))?;
        debug!(url = %url, "delete project");
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header().await?)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// Downloads one chunk of a file at a given version via a ranged GET.
    pub async fn download_chunk(
        &self,
        project_full_name: &str,
        file_path: &str,
        version: &str,
        chunk_no: u64,
    ) -> Result<Vec<u8>, MerginError> {
        let mut url = self.endpoint(&format!("/v1/project/raw/{project_full_name}"))?;
        url.query_pairs_mut()
            .append_pair("file", file_path)
            .append_pair("version", version);
        let from = self.chunk_size * chunk_no;
        let to = self.chunk_size * (chunk_no + 1) - 1;
        let range = format!("bytes={from}-{to}");
        debug!(url = %url, range = %range, "download chunk");
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header().await?)
            .header("Range", range)
            .send()
            .await?;
        Self::raw_body(response).await
    }

    /// Opens a push. The response either carries a `transaction` UUID (chunks
    /// follow) or, for a delete-only push, the full metadata of the version
    /// the server created immediately; the raw body is returned for the
    /// caller to interpret.
    pub async fn push_start(
        &self,
        project_full_name: &str,
        changes: &serde_json::Value,
    ) -> Result<Vec<u8>, MerginError> {
        let url = self.endpoint(&format!("/v1/project/push/{project_full_name}"))?;
        debug!(url = %url, "start push");
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header().await?)
            .json(changes)
            .send()
            .await?;
        Self::raw_body(response).await
    }

    pub async fn push_chunk(
        &self,
        transaction_uuid: &str,
        chunk_id: &str,
        data: Vec<u8>,
    ) -> Result<(), MerginError> {
        let url = self.endpoint(&format!("/v1/project/push/chunk/{transaction_uuid}/{chunk_id}"))?;
        debug!(url = %url, bytes = data.len(), "upload chunk");
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header().await?)
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// Closes a push transaction; returns the metadata of the new version.
    pub async fn push_finish(&self, transaction_uuid: &str) -> Result<Vec<u8>, MerginError> {
        let url = self.endpoint(&format!("/v1/project/push/finish/{transaction_uuid}"))?;
        debug!(url = %url, "finish push");
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header().await?)
            .send()
            .await?;
        Self::raw_body(response).await
    }

    pub async fn push_cancel(&self, transaction_uuid: &str) -> Result<(), MerginError> {
        let url = self.endpoint(&format!("/v1/project/push/cancel/{transaction_uuid}"))?;
        debug!(url = %url, "cancel push");
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header().await?)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn auth_header(&self) -> Result<String, MerginError> {
        Ok(format!("Bearer {}", self.auth.valid_token().await?))
    }

    fn endpoint(&self, path: &str) -> Result<Url, MerginError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, MerginError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn raw_body(response: reqwest::Response) -> Result<Vec<u8>, MerginError> {
        let response = Self::check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, MerginError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(MerginError::Api {
                status,
                detail: extract_error_detail(&body),
            })
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectListFilter {
    pub tags: String,
    pub search: String,
    pub flag: String,
    pub user: String,
}

#[derive(Debug, Deserialize)]
pub struct PingResponse {
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UserInfo {
    #[serde(default)]
    pub disk_usage: u64,
    #[serde(default)]
    pub storage_limit: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectListEntry {
    pub name: String,
    pub namespace: String,
    pub version: i64,
    pub creator: i64,
    pub writers: Vec<i64>,
    pub updated: Option<OffsetDateTime>,
}

impl ProjectListEntry {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Deserialize)]
struct RawProjectEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    creator: i64,
    #[serde(default)]
    access: Option<RawProjectAccess>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    created: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProjectAccess {
    #[serde(default)]
    writers: Vec<i64>,
}

impl From<RawProjectEntry> for ProjectListEntry {
    fn from(raw: RawProjectEntry) -> Self {
        // some projects report no "updated" timestamp yet; fall back to "created"
        let updated = parse_timestamp(raw.updated.as_deref())
            .or_else(|| parse_timestamp(raw.created.as_deref()));
        Self {
            name: raw.name,
            namespace: raw.namespace,
            version: parse_version_label(&raw.version),
            creator: raw.creator,
            writers: raw.access.map(|access| access.writers).unwrap_or_default(),
            updated,
        }
    }
}

fn parse_timestamp(value: Option<&str>) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value?, &Rfc3339).ok()
}
