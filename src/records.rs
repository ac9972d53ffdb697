use std::future::Future;

use log::{info, warn};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A saved session as returned by the remote record store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub id: i64,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub avg_bpm: f64,
    pub signal_quality: String,
}

/// Payload submitted when saving a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewHistoryRecord {
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub avg_bpm: f64,
    pub signal_quality: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub trait RecordStore: Send + Sync {
    fn list_records(&self) -> impl Future<Output = Result<Vec<HistoryRecord>, StoreError>> + Send;

    fn create_record(
        &self,
        record: &NewHistoryRecord,
    ) -> impl Future<Output = Result<HistoryRecord, StoreError>> + Send;
}

/// Bearer-token client for the `/history` endpoints.
#[derive(Clone)]
pub struct HttpRecordStore {
    client: Client,
    api_url: String,
    token: String,
}

impl HttpRecordStore {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Exchanges credentials for an access token.
    pub async fn login(api_url: &str, username: &str, password: &str) -> Result<String, StoreError> {
        let url = format!("{}/auth/token", api_url.trim_end_matches('/'));
        let response = Client::new()
            .post(url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        let token: TokenResponse = check_login_status(response)?.json().await?;
        info!("Signed in as {}", username);
        Ok(token.access_token)
    }

    fn history_url(&self) -> String {
        format!("{}/history/", self.api_url)
    }
}

fn check_login_status(response: Response) -> Result<Response, StoreError> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST => {
            warn!("Record store refused the credentials");
            Err(StoreError::LoginFailed)
        }
        _ => check_status(response),
    }
}

fn check_status(response: Response) -> Result<Response, StoreError> {
    match response.status() {
        StatusCode::UNAUTHORIZED => {
            warn!("Record store rejected the access token");
            Err(StoreError::AuthorizationExpired)
        }
        status if !status.is_success() => Err(StoreError::Rejected {
            status: status.as_u16(),
        }),
        _ => Ok(response),
    }
}

impl RecordStore for HttpRecordStore {
    async fn list_records(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        let response = self
            .client
            .get(self.history_url())
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(check_status(response)?.json().await?)
    }

    async fn create_record(&self, record: &NewHistoryRecord) -> Result<HistoryRecord, StoreError> {
        let response = self
            .client
            .post(self.history_url())
            .bearer_auth(&self.token)
            .json(record)
            .send()
            .await?;
        let saved: HistoryRecord = check_status(response)?.json().await?;
        info!("Saved session record {} ({} bpm)", saved.id, saved.avg_bpm);
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Answers every request with `status` and an empty JSON body.
    async fn answering(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let reply = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}"
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}/api")
    }

    #[tokio::test]
    async fn wrong_password_is_a_failed_login() {
        let api = answering("401 Unauthorized").await;
        let err = HttpRecordStore::login(&api, "ada", "wrong").await.unwrap_err();
        assert_matches!(err, StoreError::LoginFailed);
    }

    #[tokio::test]
    async fn rejected_token_means_authorization_expired() {
        let api = answering("401 Unauthorized").await;
        let store = HttpRecordStore::new(api, "stale");
        assert_matches!(
            store.list_records().await,
            Err(StoreError::AuthorizationExpired)
        );
    }

    #[test]
    fn new_record_serializes_with_snake_case_fields() {
        let record = NewHistoryRecord {
            date: "2026-10-19".into(),
            start_time: "08:30".into(),
            end_time: "08:45".into(),
            avg_bpm: 104.3,
            signal_quality: "Good".into(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["start_time"], "08:30");
        assert_eq!(value["avg_bpm"], 104.3);
        assert_eq!(value["signal_quality"], "Good");
    }

    #[test]
    fn history_record_ignores_server_only_fields() {
        let raw = r#"{"id":7,"user_id":1,"created_at":"2026-10-19T08:45:00",
            "date":"2026-10-19","start_time":"08:30","end_time":"08:45",
            "avg_bpm":98.5,"signal_quality":"Fair"}"#;
        let record: HistoryRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.signal_quality, "Fair");
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let store = HttpRecordStore::new("http://localhost:8000/api/", "token");
        assert_eq!(store.history_url(), "http://localhost:8000/api/history/");
    }
}
