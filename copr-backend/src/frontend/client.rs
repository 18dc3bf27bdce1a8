//! HTTP client of the frontend's `/backend/` API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{FrontendApi, ReadyTasks, UpdatePayload, UpdateResponse};
use crate::config::FrontendConfig;
use crate::task::{ActionTask, BuildTask};
use crate::{Error, Result};

/// Header carrying the frontend/backend protocol version.
pub const API_VERSION_HEADER: &str = "Copr-FE-BE-API-Version";

/// Talks to `{base_url}/backend/{path}/` with bounded retries.
///
/// Server errors (5xx) and connection failures are retried with a growing
/// pause; client errors (4xx) fail immediately.
pub struct HttpFrontendClient {
    base_url: String,
    auth: Option<String>,
    client: Client,
    max_retries: u32,
    retry_backoff: Duration,
    min_api_version: u32,
}

#[derive(Debug, Deserialize)]
struct CanStart {
    can_start: Option<bool>,
}

enum Attempt {
    Done(Response),
    Retry(String),
}

impl HttpFrontendClient {
    pub fn new(config: &FrontendConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth: config.auth.clone(),
            client,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            min_api_version: config.min_api_version,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/backend/{}/", self.base_url, path.trim_matches('/'))
    }

    async fn attempt(&self, method: &Method, url: &str, body: Option<&Value>) -> Result<Attempt> {
        let mut request = self.client.request(method.clone(), url);
        if let Some(auth) = &self.auth {
            request = request.basic_auth("user", Some(auth));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Retry(format!("request error on {}: {}", url, e))),
        };

        let status = response.status();
        if status.is_server_error() {
            return Ok(Attempt::Retry(format!("server error on {}: {}", url, status)));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(client_error(url, status, &body));
        }

        check_api_version(&response, self.min_api_version)?;
        Ok(Attempt::Done(response))
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response> {
        let url = self.url(path);
        info!("Sending {} request to frontend URL - {}", method, url);

        let mut sleep = self.retry_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&method, &url, body).await? {
                Attempt::Done(response) => return Ok(response),
                Attempt::Retry(detail) if attempt <= self.max_retries => {
                    warn!("Retry request #{} on {}: {}", attempt, url, detail);
                    tokio::time::sleep(sleep).await;
                    sleep += self.retry_backoff;
                }
                Attempt::Retry(detail) => {
                    return Err(Error::frontend(format!(
                        "giving up after {} attempts: {}",
                        attempt, detail
                    )));
                }
            }
        }
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let response = self.send(Method::GET, path, None).await?;
        Ok(response.json().await?)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Response> {
        self.send(Method::POST, path, Some(body)).await
    }
}

fn client_error(url: &str, status: StatusCode, body: &str) -> Error {
    Error::Other(format!(
        "frontend rejected request on {}: {} {}",
        url, status, body
    ))
}

/// Reject frontends speaking an older protocol than `min_version`.
pub(crate) fn check_api_version(response: &Response, min_version: u32) -> Result<()> {
    let header = response
        .headers()
        .get(API_VERSION_HEADER)
        .and_then(|v| v.to_str().ok());
    api_version_ok(header, min_version)
}

fn api_version_ok(header: Option<&str>, min_version: u32) -> Result<()> {
    let version = header.and_then(|v| v.trim().parse::<u32>().ok()).unwrap_or(0);
    if version >= min_version {
        Ok(())
    } else {
        Err(Error::frontend(format!(
            "Copr FE/BE API is too old on Frontend side, {} < {}",
            version, min_version
        )))
    }
}

#[async_trait]
impl FrontendApi for HttpFrontendClient {
    async fn ready_tasks(&self) -> Result<ReadyTasks> {
        let builds: Vec<Value> = self.get_json("pending-jobs").await?;
        let actions: Vec<ActionTask> = self.get_json("pending-actions").await?;

        // One malformed build must not hide the rest of the queue.
        let builds = builds
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<BuildTask>(raw) {
                Ok(build) => Some(build),
                Err(e) => {
                    warn!("Skipping malformed build task: {}", e);
                    None
                }
            })
            .collect();

        Ok(ReadyTasks { actions, builds })
    }

    async fn update(&self, payload: &UpdatePayload) -> Result<UpdateResponse> {
        let body = serde_json::to_value(payload)?;
        let response = self.post("update", &body).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(UpdateResponse::default());
        }
        let parsed: UpdateResponse = serde_json::from_str(&text)?;
        if !parsed.non_existing_builds_ids.is_empty() || !parsed.non_existing_actions_ids.is_empty()
        {
            debug!(
                builds = ?parsed.non_existing_builds_ids,
                actions = ?parsed.non_existing_actions_ids,
                "Frontend does not know some updated objects"
            );
        }
        Ok(parsed)
    }

    async fn starting_build(&self, build_id: i64, chroot: &str) -> Result<bool> {
        let body = json!({"build_id": build_id, "chroot": chroot});
        let response: CanStart = self.post("starting_build", &body).await?.json().await?;
        response
            .can_start
            .ok_or_else(|| Error::frontend("Bad response from the frontend"))
    }

    async fn reschedule_build(&self, build_id: i64, task_id: &str, chroot: &str) -> Result<()> {
        let body = json!({"build_id": build_id, "task_id": task_id, "chroot": chroot});
        self.post("reschedule_build_chroot", &body).await?;
        Ok(())
    }

    async fn get_action(&self, action_id: i64) -> Result<ActionTask> {
        self.get_json(&format!("action/{}", action_id)).await
    }

    async fn cancel_requests(&self) -> Result<Vec<String>> {
        let ids: Vec<Value> = self.get_json("build-tasks/cancel-requests").await?;
        Ok(ids
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect())
    }

    async fn report_canceled(&self, task_id: &str, was_running: bool) -> Result<()> {
        self.post(
            &format!("build-tasks/canceled/{}", task_id),
            &Value::Bool(was_running),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn config(base_url: &str) -> FrontendConfig {
        FrontendConfig {
            base_url: base_url.to_string(),
            auth: Some("secret".to_string()),
            request_timeout_secs: 5,
            max_retries: 2,
            retry_backoff_ms: 1,
            min_api_version: 4,
        }
    }

    /// Serve `responses` in order, one per connection, counting requests.
    async fn serve(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for response in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 16 * 1024];
                let _ = socket.read(&mut buf).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), hits)
    }

    fn http(status: &str, api_version: Option<&str>, body: &str) -> String {
        let header = api_version
            .map(|v| format!("{}: {}\r\n", API_VERSION_HEADER, v))
            .unwrap_or_default();
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            header,
            body.len(),
            body
        )
    }

    #[test]
    fn test_url() {
        let client = HttpFrontendClient::new(&config("http://fe.example/"));
        assert_eq!(
            client.url("build-tasks/cancel-requests"),
            "http://fe.example/backend/build-tasks/cancel-requests/"
        );
    }

    #[test]
    fn test_api_version() {
        assert!(api_version_ok(Some("6"), 4).is_ok());
        assert!(api_version_ok(Some("4"), 4).is_ok());
        assert!(api_version_ok(Some("3"), 4).is_err());
        assert!(api_version_ok(None, 4).is_err());
        assert!(api_version_ok(Some("junk"), 4).is_err());
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let (url, hits) = serve(vec![
            http("503 Service Unavailable", None, ""),
            http("200 OK", Some("6"), r#"{"can_start": true}"#),
        ])
        .await;
        let client = HttpFrontendClient::new(&config(&url));
        assert!(client.starting_build(1, "fedora-39-x86_64").await.unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (url, hits) = serve(vec![
            http("403 Forbidden", None, "nope"),
            http("200 OK", Some("6"), "[]"),
        ])
        .await;
        let client = HttpFrontendClient::new(&config(&url));
        let err = client.cancel_requests().await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_old_frontend_is_rejected() {
        let (url, _) = serve(vec![http("200 OK", Some("3"), "[]")]).await;
        let client = HttpFrontendClient::new(&config(&url));
        assert!(matches!(
            client.cancel_requests().await,
            Err(Error::FrontendUnavailable(_))
        ));
    }
}
