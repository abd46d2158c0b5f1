//! Chat backend collaborator
//!
//! Every payload is decoded into an explicit type here; anything that does not
//! match becomes `Error::Parse` and never reaches the session.

use crate::analysis::AnalysisReport;
use crate::config::Config;
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::messages::Message;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The signed-in user
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub friends: Vec<String>,
}

/// An identity flagged by the detection pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedIdentity {
    pub username: String,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    receiver_id: &'a str,
    message: &'a str,
}

/// Request/response API the session consumes
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    async fn fetch_profile(&self, credential: &Credential) -> Result<Profile>;

    async fn fetch_friends(&self, credential: &Credential, user_id: &str) -> Result<Vec<String>>;

    async fn fetch_detected_identities(
        &self,
        credential: &Credential,
    ) -> Result<Vec<DetectedIdentity>>;

    async fn fetch_history(&self, credential: &Credential, peer: &str) -> Result<Vec<Message>>;

    /// Persist a message; the stored copy comes back as the ack
    async fn send_durable(
        &self,
        credential: &Credential,
        peer: &str,
        content: &str,
    ) -> Result<Message>;

    async fn start_analysis(&self, credential: &Credential, target: &str) -> Result<()>;

    async fn poll_analysis(&self, credential: &Credential, target: &str) -> Result<AnalysisReport>;
}

/// `ChatBackend` over the HTTP API
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        path: &str,
    ) -> Result<T> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(credential.token())
            .send()
            .await?;
        decode(response, path).await
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        credential: &Credential,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let body = self.post(credential, path, body).await?;
        parse_body(&body, path)
    }

    /// POST and return the raw body of a 2xx response
    async fn post<B: Serialize + Sync>(
        &self,
        credential: &Credential,
        path: &str,
        body: Option<&B>,
    ) -> Result<String> {
        let url = self.url(path);
        debug!("POST {}", url);
        let mut request = self.client.post(&url).bearer_auth(credential.token());
        if let Some(body) = body {
            request = request.json(body);
        }
        read_body(request.send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response, path: &str) -> Result<T> {
    let body = read_body(response).await?;
    parse_body(&body, path)
}

async fn read_body(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(Error::Backend {
            status: status.as_u16(),
            message: error_detail(&body),
        });
    }
    Ok(body)
}

fn parse_body<T: DeserializeOwned>(body: &str, path: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::Parse(format!("{}: {}", path, e)))
}

/// An acknowledgement may be empty (202/204); anything else must be JSON
fn check_ack(body: &str, path: &str) -> Result<()> {
    if body.trim().is_empty() {
        return Ok(());
    }
    parse_body::<serde_json::Value>(body, path).map(|_| ())
}

/// Pull `detail` out of an error body, falling back to the raw text
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn fetch_profile(&self, credential: &Credential) -> Result<Profile> {
        self.get_json(credential, "user/profile").await
    }

    async fn fetch_friends(&self, credential: &Credential, user_id: &str) -> Result<Vec<String>> {
        self.get_json(credential, &format!("friends/{}", user_id)).await
    }

    async fn fetch_detected_identities(
        &self,
        credential: &Credential,
    ) -> Result<Vec<DetectedIdentity>> {
        self.get_json(credential, "honeytrap/detections").await
    }

    async fn fetch_history(&self, credential: &Credential, peer: &str) -> Result<Vec<Message>> {
        self.get_json(credential, &format!("chat/messages/{}", peer)).await
    }

    async fn send_durable(
        &self,
        credential: &Credential,
        peer: &str,
        content: &str,
    ) -> Result<Message> {
        let body = SendRequest {
            receiver_id: peer,
            message: content,
        };
        self.post_json(credential, "chat/messages", Some(&body)).await
    }

    async fn start_analysis(&self, credential: &Credential, target: &str) -> Result<()> {
        let path = format!("analysis/start/{}", target);
        let body = self.post::<()>(credential, &path, None).await?;
        check_ack(&body, &path)
    }

    async fn poll_analysis(&self, credential: &Credential, target: &str) -> Result<AnalysisReport> {
        self.get_json(credential, &format!("analysis/status/{}", target)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisStatus;

    #[test]
    fn test_url_joining() {
        let temp = std::env::temp_dir();
        let mut config = Config::for_test(&temp);
        config.api_base_url = "http://api.local/".to_string();
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(backend.url("/chat/messages/bob"), "http://api.local/chat/messages/bob");
        assert_eq!(backend.url("user/profile"), "http://api.local/user/profile");
    }

    #[test]
    fn test_error_detail() {
        assert_eq!(error_detail(r#"{"detail":"User not found"}"#), "User not found");
        assert_eq!(error_detail("Internal Server Error"), "Internal Server Error");
        assert_eq!(error_detail(&"x".repeat(500)).len(), 200);
    }

    #[test]
    fn test_empty_ack_accepted() {
        assert!(check_ack("", "analysis/start/bob").is_ok());
        assert!(check_ack("  \n", "analysis/start/bob").is_ok());
        assert!(check_ack(r#"{"status":"started"}"#, "analysis/start/bob").is_ok());
        assert!(matches!(
            check_ack("accepted", "analysis/start/bob"),
            Err(Error::Parse(msg)) if msg.starts_with("analysis/start/bob")
        ));
    }

    #[test]
    fn test_profile_decoding() {
        let raw = r#"{"id":"65a1","username":"alice","email":"a@example.com","friends":["bob"],"friend_requests":[]}"#;
        let profile: Profile = serde_json::from_str(raw).unwrap();
        assert_eq!(profile.username, "alice");
        assert_eq!(profile.friends, vec!["bob".to_string()]);
    }

    #[test]
    fn test_history_decoding() {
        let raw = r#"[{"sender_id":"bob","receiver_id":"alice","message":"yo","timestamp":"2024-01-15T10:00:00","read":true}]"#;
        let history: Vec<Message> = serde_json::from_str(raw).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].read);
    }

    #[test]
    fn test_report_decoding() {
        let report: AnalysisReport =
            serde_json::from_str(r#"{"status":"not_genuine","verdict":"no, scripted replies"}"#)
                .unwrap();
        assert_eq!(report.status, AnalysisStatus::NotGenuine);
        assert!(report.is_terminal());

        let report: AnalysisReport =
            serde_json::from_str(r#"{"status":"no_analysis_found"}"#).unwrap();
        assert!(!report.is_terminal());
    }

    #[test]
    fn test_send_request_shape() {
        let body = SendRequest {
            receiver_id: "bob",
            message: "hi",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["receiver_id"], "bob");
        assert_eq!(json["message"], "hi");
    }
}
