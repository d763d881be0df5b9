//! reqwest implementation of [`GitLabApi`] against the REST v4 API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::{
    GitLabApi, GitLabClientFactory, GitLabError, GitLabErrorKind, Issue, IssueQuery, IssueUpdate,
    NewIssue, Note, Page, ProjectLabel, UploadedFile,
};
use crate::models::gitlab_instance;

const USER_AGENT: &str = "issue-mirror/0.1";
const LIST_PAGE_SIZE: u32 = 100;

/// HTTP client bound to one GitLab instance and token.
#[derive(Clone)]
pub struct GitLabClient {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for GitLabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitLabClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GitLabClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, GitLabError> {
        let mut headers = HeaderMap::new();
        let token_value = HeaderValue::from_str(token).map_err(|_| {
            GitLabError::new(
                GitLabErrorKind::Permanent,
                "client setup",
                "API token contains invalid header characters",
            )
        })?;
        headers.insert("PRIVATE-TOKEN", token_value);
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| {
                GitLabError::new(
                    GitLabErrorKind::Permanent,
                    "client setup",
                    format!("failed to build HTTP client: {e}"),
                )
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v4{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.api_url(path))
    }

    /// Send and classify non-success statuses.
    async fn send(&self, request: RequestBuilder, endpoint: &str) -> Result<Response, GitLabError> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                counter!("gitlab_api_calls_total", "outcome" => "transport_error").increment(1);
                return Err(transport_error(endpoint, err));
            }
        };

        let status = response.status();
        if status.is_success() {
            counter!("gitlab_api_calls_total", "outcome" => "success").increment(1);
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        let error = GitLabError::from_status(status.as_u16(), retry_after, endpoint, &body);

        if error.kind == GitLabErrorKind::Transient || status.as_u16() == 429 {
            warn!(endpoint, status = status.as_u16(), "GitLab request failed");
        } else {
            debug!(endpoint, status = status.as_u16(), "GitLab request rejected");
        }
        if status.as_u16() == 429 {
            counter!("gitlab_rate_limited_total").increment(1);
        }
        counter!("gitlab_api_calls_total", "outcome" => "error").increment(1);
        Err(error)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        endpoint: &str,
    ) -> Result<T, GitLabError> {
        let response = self.send(request, endpoint).await?;
        decode(response, endpoint).await
    }

    /// One page of a listing, returning the `x-next-page` cursor alongside.
    async fn get_page<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        endpoint: &str,
    ) -> Result<Page<T>, GitLabError> {
        let response = self.send(request, endpoint).await?;
        let next_page = response
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u32>().ok());
        let items = decode(response, endpoint).await?;
        Ok(Page { items, next_page })
    }

    /// Follow `x-next-page` until exhausted.
    async fn get_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, GitLabError> {
        let endpoint = format!("GET {path}");
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let request = self
                .request(Method::GET, path)
                .query(query)
                .query(&[("page", page.to_string()), ("per_page", LIST_PAGE_SIZE.to_string())]);
            let Page { items, next_page } = self.get_page::<T>(request, &endpoint).await?;
            all.extend(items);
            match next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        Ok(all)
    }

    async fn post_time(
        &self,
        project_id: i64,
        issue_iid: i64,
        action: &str,
        duration: Option<&str>,
    ) -> Result<(), GitLabError> {
        let path = format!("/projects/{project_id}/issues/{issue_iid}/{action}");
        let endpoint = format!("POST {path}");
        let mut request = self.request(Method::POST, &path);
        if let Some(duration) = duration {
            request = request.query(&[("duration", duration)]);
        }
        self.send(request, &endpoint).await.map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(response: Response, endpoint: &str) -> Result<T, GitLabError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_error(endpoint, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| GitLabError::malformed(endpoint, format!("failed to decode response: {e}")))
}

fn transport_error(endpoint: &str, err: reqwest::Error) -> GitLabError {
    if err.is_decode() {
        return GitLabError::malformed(endpoint, err.to_string());
    }
    if err.is_builder() {
        return GitLabError::new(GitLabErrorKind::Permanent, endpoint, err.to_string());
    }
    GitLabError::new(GitLabErrorKind::Transient, endpoint, err.to_string())
}

fn issue_body(
    title: Option<&String>,
    description: Option<&String>,
    labels: Option<&Vec<String>>,
    weight: Option<i64>,
) -> Map<String, Value> {
    let mut body = Map::new();
    if let Some(title) = title {
        body.insert("title".into(), json!(title));
    }
    if let Some(description) = description {
        body.insert("description".into(), json!(description));
    }
    if let Some(labels) = labels {
        body.insert("labels".into(), json!(labels.join(",")));
    }
    if let Some(weight) = weight {
        body.insert("weight".into(), json!(weight));
    }
    body
}

#[async_trait]
impl GitLabApi for GitLabClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_issues(
        &self,
        project_id: i64,
        query: &IssueQuery,
    ) -> Result<Page<Issue>, GitLabError> {
        let path = format!("/projects/{project_id}/issues");
        let endpoint = format!("GET {path}");

        let mut params: Vec<(&str, String)> = vec![
            ("state", query.state.as_str().to_string()),
            ("order_by", "updated_at".to_string()),
            ("sort", "asc".to_string()),
            ("page", query.page.to_string()),
            ("per_page", query.per_page.to_string()),
        ];
        if let Some(updated_after) = query.updated_after {
            params.push(("updated_after", updated_after.to_rfc3339()));
        }
        if !query.labels.is_empty() {
            params.push(("labels", query.labels.join(",")));
        }
        if let Some(search) = &query.search {
            params.push(("search", search.clone()));
        }

        let request = self.request(Method::GET, &path).query(&params);
        self.get_page(request, &endpoint).await
    }

    async fn get_issue(&self, project_id: i64, issue_iid: i64) -> Result<Issue, GitLabError> {
        let path = format!("/projects/{project_id}/issues/{issue_iid}");
        let endpoint = format!("GET {path}");
        self.send_json(self.request(Method::GET, &path), &endpoint)
            .await
    }

    async fn create_issue(&self, project_id: i64, issue: &NewIssue) -> Result<Issue, GitLabError> {
        let path = format!("/projects/{project_id}/issues");
        let endpoint = format!("POST {path}");
        let body = issue_body(
            Some(&issue.title),
            Some(&issue.description),
            Some(&issue.labels),
            issue.weight,
        );
        self.send_json(self.request(Method::POST, &path).json(&body), &endpoint)
            .await
    }

    async fn update_issue(
        &self,
        project_id: i64,
        issue_iid: i64,
        update: &IssueUpdate,
    ) -> Result<Issue, GitLabError> {
        let path = format!("/projects/{project_id}/issues/{issue_iid}");
        let endpoint = format!("PUT {path}");
        let mut body = issue_body(
            update.title.as_ref(),
            update.description.as_ref(),
            update.labels.as_ref(),
            update.weight,
        );
        if let Some(event) = update.state_event {
            body.insert("state_event".into(), json!(event.as_str()));
        }
        self.send_json(self.request(Method::PUT, &path).json(&body), &endpoint)
            .await
    }

    async fn get_issue_notes(
        &self,
        project_id: i64,
        issue_iid: i64,
    ) -> Result<Vec<Note>, GitLabError> {
        let path = format!("/projects/{project_id}/issues/{issue_iid}/notes");
        self.get_all(
            &path,
            &[
                ("order_by", "created_at".to_string()),
                ("sort", "asc".to_string()),
            ],
        )
        .await
    }

    async fn create_issue_note(
        &self,
        project_id: i64,
        issue_iid: i64,
        body: &str,
    ) -> Result<Note, GitLabError> {
        let path = format!("/projects/{project_id}/issues/{issue_iid}/notes");
        let endpoint = format!("POST {path}");
        self.send_json(
            self.request(Method::POST, &path).json(&json!({ "body": body })),
            &endpoint,
        )
        .await
    }

    async fn update_issue_note(
        &self,
        project_id: i64,
        issue_iid: i64,
        note_id: i64,
        body: &str,
    ) -> Result<Note, GitLabError> {
        let path = format!("/projects/{project_id}/issues/{issue_iid}/notes/{note_id}");
        let endpoint = format!("PUT {path}");
        self.send_json(
            self.request(Method::PUT, &path).json(&json!({ "body": body })),
            &endpoint,
        )
        .await
    }

    async fn get_project_labels(&self, project_id: i64) -> Result<Vec<ProjectLabel>, GitLabError> {
        self.get_all(&format!("/projects/{project_id}/labels"), &[])
            .await
    }

    async fn create_label(
        &self,
        project_id: i64,
        name: &str,
        color: &str,
    ) -> Result<ProjectLabel, GitLabError> {
        let path = format!("/projects/{project_id}/labels");
        let endpoint = format!("POST {path}");
        let request = self
            .request(Method::POST, &path)
            .json(&json!({ "name": name, "color": color }));
        match self.send_json(request, &endpoint).await {
            Ok(label) => Ok(label),
            // Created concurrently or already present.
            Err(err) if err.is_conflict() => Ok(ProjectLabel {
                id: 0,
                name: name.to_string(),
                color: Some(color.to_string()),
            }),
            Err(err) => Err(err),
        }
    }

    async fn set_time_estimate(
        &self,
        project_id: i64,
        issue_iid: i64,
        duration: &str,
    ) -> Result<(), GitLabError> {
        self.post_time(project_id, issue_iid, "time_estimate", Some(duration))
            .await
    }

    async fn reset_time_spent(&self, project_id: i64, issue_iid: i64) -> Result<(), GitLabError> {
        self.post_time(project_id, issue_iid, "reset_spent_time", None)
            .await
    }

    async fn add_time_spent(
        &self,
        project_id: i64,
        issue_iid: i64,
        duration: &str,
    ) -> Result<(), GitLabError> {
        self.post_time(project_id, issue_iid, "add_spent_time", Some(duration))
            .await
    }

    async fn upload_file(
        &self,
        project_id: i64,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<UploadedFile, GitLabError> {
        let path = format!("/projects/{project_id}/uploads");
        let endpoint = format!("POST {path}");
        let part = reqwest::multipart::Part::bytes(content).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        self.send_json(self.request(Method::POST, &path).multipart(form), &endpoint)
            .await
    }
}

/// Builds [`GitLabClient`]s from stored instance rows.
#[derive(Debug, Clone)]
pub struct HttpGitLabClientFactory {
    timeout: Duration,
}

impl HttpGitLabClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl GitLabClientFactory for HttpGitLabClientFactory {
    fn client_for(
        &self,
        instance: &gitlab_instance::Model,
    ) -> Result<Arc<dyn GitLabApi>, GitLabError> {
        let client = GitLabClient::new(instance.base_url(), &instance.api_token, self.timeout)?;
        Ok(Arc::new(client))
    }
}
