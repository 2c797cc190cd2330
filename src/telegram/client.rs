//! Bot API HTTP client.
//!
//! Every call carries explicit connect and total timeouts. Calls that are
//! safe to repeat retry transport failures and 5xx responses a bounded
//! number of times; identity checks and long polls never retry.

use std::path::Path;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::config::TelegramConfig;
use crate::error::ProviderError;
use crate::telegram::types::{ApiResponse, FileInfo, MediaKind, SentMessage, User};

/// Longest provider body excerpt kept in an error value.
const ERROR_BODY_EXCERPT: usize = 200;

/// Bot API client shared by the poller, dispatcher, worker, and file proxy.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &TelegramConfig {
        &self.config
    }

    fn api_url(&self, token: &SecretString, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base,
            token.expose_secret()
        )
    }

    fn file_url(&self, token: &SecretString, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.config.api_base,
            token.expose_secret(),
            file_path.trim_start_matches('/')
        )
    }

    /// Validate a token with `getMe`. Never retried.
    pub async fn get_me(&self, token: &SecretString) -> Result<User, ProviderError> {
        let resp = self
            .http
            .get(self.api_url(token, "getMe"))
            .timeout(self.config.identity_timeout)
            .send()
            .await?;
        decode_envelope(resp).await
    }

    /// Fetch a batch of raw updates. Never retried; the next sweep is the
    /// retry.
    pub async fn get_updates(
        &self,
        token: &SecretString,
        offset: Option<i64>,
        limit: u32,
        long_poll_secs: u64,
        request_timeout: Duration,
    ) -> Result<Vec<serde_json::Value>, ProviderError> {
        let mut query: Vec<(&str, String)> = vec![
            ("limit", limit.to_string()),
            ("timeout", long_poll_secs.to_string()),
        ];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        let resp = self
            .http
            .get(self.api_url(token, "getUpdates"))
            .query(&query)
            .timeout(request_timeout)
            .send()
            .await?;
        decode_envelope(resp).await
    }

    /// `sendMessage` with the transport retry budget.
    pub async fn send_message(
        &self,
        token: &SecretString,
        chat_id: &str,
        text: &str,
    ) -> Result<SentMessage, ProviderError> {
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        let url = self.api_url(token, "sendMessage");

        let raw: serde_json::Value = self
            .with_retry("sendMessage", || {
                self.http
                    .post(&url)
                    .json(&body)
                    .timeout(self.config.send_timeout)
                    .send()
            })
            .await?;
        SentMessage::from_raw(raw).map_err(ProviderError::Malformed)
    }

    /// Upload a local file with the method chosen by `kind`. The file is
    /// streamed from disk and reopened for every attempt.
    pub async fn send_media(
        &self,
        token: &SecretString,
        chat_id: &str,
        kind: MediaKind,
        upload: &MediaUpload<'_>,
    ) -> Result<SentMessage, ProviderError> {
        let url = self.api_url(token, kind.method());
        let attempts = self.config.retry_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let form = self.media_form(chat_id, kind, upload).await?;
            let started = Instant::now();
            let result = self
                .http
                .post(&url)
                .multipart(form)
                .timeout(self.config.upload_timeout)
                .send()
                .await;

            let outcome = match result {
                Ok(resp) => decode_envelope::<serde_json::Value>(resp).await,
                Err(e) => Err(ProviderError::from(e)),
            };
            debug!(
                method = kind.method(),
                attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = outcome.is_ok(),
                "Upload attempt finished"
            );

            match outcome {
                Ok(raw) => return SentMessage::from_raw(raw).map_err(ProviderError::Malformed),
                Err(e) if is_retriable(&e) && attempt < attempts => {
                    warn!(method = kind.method(), attempt, error = %e, "Retrying upload");
                    last_err = Some(e);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| ProviderError::Transport("no attempt made".into())))
    }

    async fn media_form(
        &self,
        chat_id: &str,
        kind: MediaKind,
        upload: &MediaUpload<'_>,
    ) -> Result<Form, ProviderError> {
        let file = tokio::fs::File::open(upload.path)
            .await
            .map_err(|e| ProviderError::LocalFile(format!("{}: {e}", upload.path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| ProviderError::LocalFile(format!("{}: {e}", upload.path.display())))?
            .len();

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let mut part = Part::stream_with_length(body, len).file_name(upload.file_name.to_string());
        if let Some(mime) = upload.mime {
            part = part
                .mime_str(mime)
                .map_err(|e| ProviderError::LocalFile(format!("bad mime type {mime}: {e}")))?;
        }

        let mut form = Form::new().text("chat_id", chat_id.to_string());
        if let Some(caption) = upload.caption.filter(|c| !c.is_empty()) {
            form = form.text("caption", caption.to_string());
        }
        Ok(form.part(kind.field(), part))
    }

    /// Resolve a file handle to a downloadable path.
    pub async fn get_file(
        &self,
        token: &SecretString,
        file_id: &str,
    ) -> Result<FileInfo, ProviderError> {
        let resp = self
            .http
            .get(self.api_url(token, "getFile"))
            .query(&[("file_id", file_id)])
            .timeout(self.config.file_meta_timeout)
            .send()
            .await?;
        decode_envelope(resp).await
    }

    /// Start a raw file download. The caller consumes the body stream.
    pub async fn download_file(
        &self,
        token: &SecretString,
        file_path: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .http
            .get(self.file_url(token, file_path))
            .timeout(self.config.download_timeout)
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(ProviderError::Unauthorized),
            s if s.is_success() => Ok(resp),
            s => Err(ProviderError::Http {
                status: s.as_u16(),
                body: excerpt(&resp.text().await.unwrap_or_default()),
            }),
        }
    }

    /// Repeat a JSON call on transport failures and 5xx responses.
    async fn with_retry<T, F, Fut>(&self, method: &str, mut send: F) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let outcome = match send().await {
                Ok(resp) => decode_envelope::<T>(resp).await,
                Err(e) => Err(ProviderError::from(e)),
            };
            debug!(
                method,
                attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = outcome.is_ok(),
                "Provider call finished"
            );

            match outcome {
                Err(e) if is_retriable(&e) && attempt < attempts => {
                    warn!(method, attempt, error = %e, "Retrying provider call");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                other => return other,
            }
        }
    }
}

/// A staged file to upload.
#[derive(Debug, Clone, Copy)]
pub struct MediaUpload<'a> {
    pub path: &'a Path,
    pub file_name: &'a str,
    pub mime: Option<&'a str>,
    pub caption: Option<&'a str>,
}

fn is_retriable(err: &ProviderError) -> bool {
    match err {
        ProviderError::Transport(_) => true,
        ProviderError::Http { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(ERROR_BODY_EXCERPT).collect()
}

/// Check status, then the `ok` flag, then extract `result`.
async fn decode_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ProviderError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ProviderError::Unauthorized);
    }

    let body = resp.text().await?;
    if !status.is_success() {
        let description = serde_json::from_str::<ApiResponse<serde_json::Value>>(&body)
            .ok()
            .and_then(|env| env.description)
            .unwrap_or(body);
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body: excerpt(&description),
        });
    }

    let envelope: ApiResponse<T> =
        serde_json::from_str(&body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
    if !envelope.ok {
        return Err(ProviderError::Rejected(
            envelope
                .description
                .map(|d| excerpt(&d))
                .unwrap_or_else(|| "ok=false".into()),
        ));
    }
    envelope
        .result
        .ok_or_else(|| ProviderError::Malformed("missing result".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const TOKEN: &str = "123456:TEST-token-abcdefghij";

    fn token() -> SecretString {
        SecretString::from(TOKEN.to_string())
    }

    fn client_for(server: &mockito::ServerGuard) -> TelegramClient {
        TelegramClient::new(TelegramConfig {
            api_base: server.url(),
            retry_delay: Duration::from_millis(10),
            ..TelegramConfig::default()
        })
        .unwrap()
    }

    fn path(method: &str) -> String {
        format!("/bot{TOKEN}/{method}")
    }

    #[tokio::test]
    async fn get_me_returns_identity() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", path("getMe").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"ok":true,"result":{"id":42,"is_bot":true,"first_name":"Helper","username":"helper_bot"}}"#,
            )
            .create_async()
            .await;

        let me = client_for(&server).get_me(&token()).await.unwrap();
        assert_eq!(me.id.as_str(), "42");
        assert_eq!(me.username.as_deref(), Some("helper_bot"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unauthorized_is_distinct() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", path("getMe").as_str())
            .with_status(401)
            .with_body(r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#)
            .create_async()
            .await;

        let err = client_for(&server).get_me(&token()).await.unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn ok_false_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", path("getUpdates").as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"ok":false,"description":"Conflict: webhook is active"}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .get_updates(&token(), None, 50, 0, Duration::from_secs(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(ref d) if d.contains("webhook")));
    }

    #[tokio::test]
    async fn get_updates_sends_offset() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", path("getUpdates").as_str())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("offset".into(), "101".into()),
                Matcher::UrlEncoded("limit".into(), "50".into()),
                Matcher::UrlEncoded("timeout".into(), "0".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":[{"update_id":101}]}"#)
            .create_async()
            .await;

        let updates = client_for(&server)
            .get_updates(&token(), Some(101), 50, 0, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(updates.len(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_message_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", path("sendMessage").as_str())
            .with_status(502)
            .with_body("bad gateway")
            .expect(2)
            .create_async()
            .await;

        let err = client_for(&server)
            .send_message(&token(), "555", "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 502, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_message_does_not_retry_client_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", path("sendMessage").as_str())
            .with_status(400)
            .with_body(r#"{"ok":false,"description":"Bad Request: chat not found"}"#)
            .expect(1)
            .create_async()
            .await;

        let err = client_for(&server)
            .send_message(&token(), "555", "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 400, ref body } if body.contains("chat not found")));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_media_uses_kind_field() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", path("sendPhoto").as_str())
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="photo""#.into()),
                Matcher::Regex(r#"name="caption""#.into()),
            ]))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":321,"date":1700000000,"caption":"look"}}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cat.png");
        std::fs::write(&file, b"\x89PNG fake").unwrap();

        let sent = client_for(&server)
            .send_media(
                &token(),
                "555",
                MediaKind::Photo,
                &MediaUpload {
                    path: &file,
                    file_name: "cat.png",
                    mime: Some("image/png"),
                    caption: Some("look"),
                },
            )
            .await
            .unwrap();
        assert_eq!(sent.message_id, "321");
        assert_eq!(sent.caption.as_deref(), Some("look"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn send_media_missing_file_is_local_error() {
        let server = mockito::Server::new_async().await;
        let err = client_for(&server)
            .send_media(
                &token(),
                "555",
                MediaKind::Document,
                &MediaUpload {
                    path: Path::new("/nonexistent/tg_gone.pdf"),
                    file_name: "gone.pdf",
                    mime: None,
                    caption: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::LocalFile(_)));
    }

    #[tokio::test]
    async fn transport_errors_do_not_leak_token() {
        let client = TelegramClient::new(TelegramConfig {
            api_base: "http://127.0.0.1:1".into(),
            retry_attempts: 1,
            ..TelegramConfig::default()
        })
        .unwrap();
        let err = client.get_me(&token()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)));
        assert!(!err.to_string().contains(TOKEN));
    }

    #[tokio::test]
    async fn download_streams_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("/file/bot{TOKEN}/photos/file_1.jpg").as_str())
            .with_status(200)
            .with_body("JPEGDATA")
            .create_async()
            .await;

        let resp = client_for(&server)
            .download_file(&token(), "photos/file_1.jpg")
            .await
            .unwrap();
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"JPEGDATA");
    }
}
