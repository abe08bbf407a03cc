use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client as HttpClient, ClientBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, CompileOutcome, ProjectInfo};
use crate::model::RemoteEntry;

/// HTTP file store API, one project per client.
#[derive(Clone, Debug)]
pub struct ApiClient {
    base: String,
    project_id: String,
    http: HttpClient,
}

impl ApiClient {
    pub fn new(base: &str, project_id: &str, auth_token: Option<&str>) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .timeout(Duration::from_secs(10 * 60))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("treesync-rs/", env!("CARGO_PKG_VERSION")));

        if let Some(token) = auth_token {
            builder = builder.default_headers({
                let mut h = reqwest::header::HeaderMap::new();
                let value = format!("Bearer {token}");
                h.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&value)?,
                );
                h
            });
        }

        let http = builder.build()?;
        Ok(ApiClient {
            base: base.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            http,
        })
    }

    fn project_url(&self, suffix: &str) -> String {
        format!("{}/api/v1/projects/{}{suffix}", self.base, self.project_id)
    }

    /// Absolute download locator: listings may hand out relative urls.
    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base, url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl Backend for ApiClient {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn validate_token(&self) -> Result<()> {
        let url = format!("{}/api/v1/auth/validate", self.base);
        let resp = self.http.get(url).send().await?;
        map_status(resp, "validate token").await
    }

    async fn load_project_info(&self) -> Result<ProjectInfo> {
        let resp = self.http.get(self.project_url("")).send().await?;
        map_error(resp, "project info").await
    }

    async fn load_file_list(&self) -> Result<Vec<RemoteEntry>> {
        let resp = self.http.get(self.project_url("/files")).send().await?;
        let list: FileListResponse = map_error(resp, "file list").await?;
        Ok(list.files)
    }

    async fn upload(
        &self,
        relative_path: &str,
        content: Vec<u8>,
        parent: Option<&str>,
    ) -> Result<RemoteEntry> {
        let name = relative_path
            .rsplit('/')
            .next()
            .unwrap_or(relative_path)
            .to_string();
        let mut form = Form::new()
            .text("path", relative_path.to_string())
            .part("file", Part::bytes(content).file_name(name));
        if let Some(parent) = parent {
            form = form.text("parentId", parent.to_string());
        }
        let resp = self
            .http
            .post(self.project_url("/files"))
            .multipart(form)
            .send()
            .await?;
        map_error(resp, "upload").await
    }

    async fn create_remote(
        &self,
        relative_path: &str,
        parent: Option<&str>,
    ) -> Result<RemoteEntry> {
        let body = CreateFolderRequest {
            path: relative_path,
            parent_id: parent,
        };
        let resp = self
            .http
            .post(self.project_url("/folders"))
            .json(&body)
            .send()
            .await?;
        map_error(resp, "create folder").await
    }

    async fn download(&self, remote_id: &str, url: &str) -> Result<Vec<u8>> {
        let target = if url.is_empty() {
            self.project_url(&format!("/files/{remote_id}/content"))
        } else {
            self.resolve_url(url)
        };
        let resp = self.http.get(target).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(resp, "download").await);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn update_remote(&self, remote_id: &str, content: Vec<u8>) -> Result<RemoteEntry> {
        let resp = self
            .http
            .put(self.project_url(&format!("/files/{remote_id}/content")))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .send()
            .await?;
        map_error(resp, "update").await
    }

    async fn delete_remote(&self, remote_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.project_url(&format!("/files/{remote_id}")))
            .send()
            .await?;
        map_status(resp, "delete").await
    }

    async fn compile_project(&self) -> Result<CompileOutcome> {
        let resp = self.http.post(self.project_url("/compile")).send().await?;
        map_error(resp, "compile").await
    }
}

async fn map_error<T: for<'de> Deserialize<'de>>(resp: Response, op: &str) -> Result<T> {
    if resp.status().is_success() {
        let val = resp.json::<T>().await?;
        return Ok(val);
    }
    Err(status_error(resp, op).await)
}

async fn map_status(resp: Response, op: &str) -> Result<()> {
    if resp.status().is_success() {
        return Ok(());
    }
    Err(status_error(resp, op).await)
}

async fn status_error(resp: Response, op: &str) -> anyhow::Error {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => anyhow::anyhow!("{op} unauthorized: {text}"),
        StatusCode::FORBIDDEN => anyhow::anyhow!("{op} forbidden: {text}"),
        StatusCode::NOT_FOUND => anyhow::anyhow!("{op} not found: {text}"),
        _ => anyhow::anyhow!("{op} failed: {status} {text}"),
    }
}

#[derive(Debug, Deserialize)]
struct FileListResponse {
    files: Vec<RemoteEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateFolderRequest<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
}
