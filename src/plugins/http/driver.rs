use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::plugins::registry::{
    ApiError, BackendApi, CoursesRequest, CoursesResponse, DownloadStatusResponse, StartDownloadRequest,
    StartDownloadResponse,
};

#[derive(Debug, Clone)]
pub struct HttpContext {
    pub user_agent: String,
    pub timeout: Duration,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Client for the backend's JSON API under `<server>/api`.
pub struct HttpBackend {
    client: reqwest::Client,
    api_root: Url,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(server: &Url, ctx: &HttpContext) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .default_headers(Self::build_headers(ctx)?)
            .build()?;

        let mut api_root = server.clone();
        api_root
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("server url cannot be a base: {}", server))?
            .pop_if_empty()
            .push("api");

        Ok(Self { client, api_root, timeout: ctx.timeout })
    }

    fn build_headers(ctx: &HttpContext) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent)?);
        h.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(h)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.api_root.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Endpoint(self.api_root.to_string()))?
            .extend(segments);
        Ok(url)
    }

    /// Non-2xx responses become `ApiError::Status`, carrying the body's
    /// `error` field when the server sent one.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|b| b.error)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("server responded with {}", status));
        Err(ApiError::Status { status, message })
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
        let body: Bytes = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn health(&self) -> Result<(), ApiError> {
        let resp = self.client
            .get(self.endpoint(&["health"])?)
            .timeout(self.timeout)
            .send()
            .await?;
        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(ApiError::Status { status: resp.status(), message: "backend not responding".to_string() })
        }
    }

    async fn courses(&self, req: &CoursesRequest) -> Result<CoursesResponse, ApiError> {
        let resp = self.client
            .post(self.endpoint(&["courses"])?)
            .timeout(self.timeout)
            .json(req)
            .send()
            .await?;
        Self::decode(Self::check(resp).await?).await
    }

    async fn start_download(&self, req: &StartDownloadRequest) -> Result<StartDownloadResponse, ApiError> {
        let resp = self.client
            .post(self.endpoint(&["download", "start"])?)
            .timeout(self.timeout)
            .json(req)
            .send()
            .await?;
        Self::decode(Self::check(resp).await?).await
    }

    async fn stop_download(&self, download_id: &str) -> Result<(), ApiError> {
        let resp = self.client
            .post(self.endpoint(&["download", download_id, "stop"])?)
            .timeout(self.timeout)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    async fn download_status(&self, download_id: &str) -> Result<DownloadStatusResponse, ApiError> {
        let resp = self.client
            .get(self.endpoint(&["download", download_id, "status"])?)
            .timeout(self.timeout)
            .send()
            .await?;
        Self::decode(Self::check(resp).await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Credentials;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn courses_handler(Json(body): Json<Value>) -> (AxumStatus, Json<Value>) {
        if body["apiKey"] != "good" {
            return (AxumStatus::UNAUTHORIZED, Json(json!({"error": "Invalid Canvas API credentials"})));
        }
        assert_eq!(body["channelId"], body["socketId"]);
        (
            AxumStatus::OK,
            Json(json!({
                "courses": [{"id": 5, "name": "Physics", "course_code": "PHY5",
                             "term": {"name": "Spring"}, "file_count": 3, "folder_count": 1}],
                "user": {"id": 9, "name": "Ada"}
            })),
        )
    }

    async fn start_handler(Json(body): Json<Value>) -> (AxumStatus, Json<Value>) {
        if body["selectedCourses"].as_array().map_or(true, |a| a.is_empty()) {
            return (AxumStatus::BAD_REQUEST, Json(json!({})));
        }
        (AxumStatus::OK, Json(json!({"download_id": "dl-1", "status": "started"})))
    }

    async fn stop_handler(Path(id): Path<String>) -> (AxumStatus, Json<Value>) {
        if id == "dl-1" {
            (AxumStatus::OK, Json(json!({"status": "stopping"})))
        } else {
            (AxumStatus::NOT_FOUND, Json(json!({"error": "Download not found"})))
        }
    }

    async fn status_handler(Path(id): Path<String>) -> (AxumStatus, Json<Value>) {
        if id == "dl-1" {
            (
                AxumStatus::OK,
                Json(json!({"status": "downloading",
                            "progress": {"current": 2, "total": 9, "current_file": "PHY5/a.pdf"},
                            "logs": []})),
            )
        } else {
            (AxumStatus::NOT_FOUND, Json(json!({"error": "Download not found"})))
        }
    }

    async fn start_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let app = Router::new()
            .route("/api/health", get(|| async { Json(json!({"status": "healthy"})) }))
            .route("/api/courses", post(courses_handler))
            .route("/api/download/start", post(start_handler))
            .route("/api/download/:id/stop", post(stop_handler))
            .route("/api/download/:id/status", get(status_handler));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, handle)
    }

    fn backend(addr: SocketAddr) -> HttpBackend {
        let server = Url::parse(&format!("http://{}", addr)).unwrap();
        let ctx = HttpContext { user_agent: "test".into(), timeout: Duration::from_secs(5) };
        HttpBackend::new(&server, &ctx).unwrap()
    }

    fn creds(key: &str) -> Credentials {
        Credentials { api_url: "https://canvas.example".into(), api_key: key.into(), output_path: "./out".into() }
    }

    #[tokio::test]
    async fn health_and_course_listing() {
        let (addr, _h) = start_server().await;
        let api = backend(addr);
        api.health().await.unwrap();

        let resp = api.courses(&CoursesRequest::new(&creds("good"), Some("sid-1".into()))).await.unwrap();
        assert_eq!(resp.user.name, "Ada");
        assert_eq!(resp.courses[0].code, "PHY5");
        assert_eq!(resp.courses[0].term.name, "Spring");
    }

    #[tokio::test]
    async fn server_error_message_is_surfaced() {
        let (addr, _h) = start_server().await;
        let err = backend(addr)
            .courses(&CoursesRequest::new(&creds("bad"), None))
            .await
            .unwrap_err();
        match err {
            ApiError::Status { status, message } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(message, "Invalid Canvas API credentials");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_and_stop_round_trip() {
        let (addr, _h) = start_server().await;
        let api = backend(addr);

        let started = api
            .start_download(&StartDownloadRequest::new(&creds("good"), vec![5], Some("sid".into())))
            .await
            .unwrap();
        assert_eq!(started.download_id, "dl-1");
        api.stop_download("dl-1").await.unwrap();

        let err = api.stop_download("missing").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status, .. } if status == StatusCode::NOT_FOUND));

        let err = api
            .start_download(&StartDownloadRequest::new(&creds("good"), vec![], None))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "server responded with 400 Bad Request");
    }

    #[tokio::test]
    async fn status_carries_backend_progress() {
        let (addr, _h) = start_server().await;
        let api = backend(addr);
        let st = api.download_status("dl-1").await.unwrap();
        assert_eq!(st.status, "downloading");
        let p = st.progress.unwrap();
        assert_eq!((p.current, p.total, p.current_file.as_str()), (2, 9, "PHY5/a.pdf"));

        let err = api.download_status("gone").await.unwrap_err();
        assert_eq!(err.to_string(), "Download not found");
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(backend(addr).health().await, Err(ApiError::Network(_))));
    }
}
