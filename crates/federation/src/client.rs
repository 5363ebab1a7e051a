//! `ActivityPub` HTTP client.
//!
//! Requests go through an [`HttpTransport`] so resolution and delivery can be
//! exercised without a network. The transport never follows redirects:
//! [`ApClient::signed_get`] follows them itself, re-signing every hop, and
//! [`ApClient::post`] does not follow them at all.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, redirect::Policy};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::{FederationError, FederationResult, StatusError};
use crate::signature::{ActorKey, RequestSigner, SignatureError};

/// Redirects followed by a GET before giving up.
pub const MAX_REDIRECTS: usize = 3;

/// `Accept` header of resolution requests.
pub const AP_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// `Content-Type` of outgoing activities.
pub const AP_CONTENT_TYPE: &str = "application/activity+json";

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("Signing failed: {0}")]
    Signing(#[from] SignatureError),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<ClientError> for FederationError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Transport(_) | ClientError::Timeout => Self::Fetch(e.to_string()),
            ClientError::Signing(e) => Self::Signature(e),
            ClientError::InvalidUrl(url) => Self::InvalidObject(format!("invalid url {url}")),
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A received response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        self.status >= 300 && self.status < 400
    }

    /// Short status description for error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown")
            .to_string()
    }

    /// Turn a non-2xx response into a [`StatusError`].
    #[must_use]
    pub fn status_error(&self) -> StatusError {
        StatusError::new(self.status, self.status_text())
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Sends requests without following redirects.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ClientError>;
}

/// [`HttpTransport`] over `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .redirect(Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
        let mut builder = self.client.request(request.method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Whether a `Content-Type` denotes an `ActivityPub` document.
#[must_use]
pub fn is_activitypub_content_type(content_type: &str) -> bool {
    let lowered = content_type.to_ascii_lowercase();
    let media_type = lowered.split(';').next().unwrap_or_default().trim();
    match media_type {
        "application/activity+json" => true,
        "application/ld+json" => lowered.contains("https://www.w3.org/ns/activitystreams"),
        _ => false,
    }
}

/// Signs and sends `ActivityPub` requests.
#[derive(Clone)]
pub struct ApClient {
    transport: Arc<dyn HttpTransport>,
    signer: Arc<dyn RequestSigner>,
    user_agent: String,
}

impl ApClient {
    #[must_use]
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        signer: Arc<dyn RequestSigner>,
        instance_url: &Url,
    ) -> Self {
        let user_agent = format!(
            "apkernel/{} (+{instance_url})",
            env!("CARGO_PKG_VERSION")
        );
        Self {
            transport,
            signer,
            user_agent,
        }
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// GET an `ActivityPub` document, signed by `key` when given.
    ///
    /// Redirects are followed manually up to [`MAX_REDIRECTS`] times. Returns
    /// the final URL together with the parsed body.
    pub async fn signed_get(
        &self,
        url: &Url,
        key: Option<&ActorKey>,
    ) -> FederationResult<(Url, Value)> {
        let (final_url, response) = self.get_following_redirects(url, key, AP_ACCEPT).await?;

        let content_type = response.header("content-type").unwrap_or_default();
        if !is_activitypub_content_type(content_type) {
            return Err(FederationError::InvalidObject(format!(
                "invalid content type {content_type:?} from {final_url}"
            )));
        }

        let value = serde_json::from_slice(&response.body).map_err(|e| {
            FederationError::InvalidObject(format!("invalid json from {final_url}: {e}"))
        })?;
        Ok((final_url, value))
    }

    /// Unsigned GET of a plain JSON document (nodeinfo and the like).
    pub async fn get_json(&self, url: &Url) -> FederationResult<Value> {
        let (final_url, response) = self
            .get_following_redirects(url, None, "application/json")
            .await?;
        serde_json::from_slice(&response.body).map_err(|e| {
            FederationError::InvalidObject(format!("invalid json from {final_url}: {e}"))
        })
    }

    async fn get_following_redirects(
        &self,
        url: &Url,
        key: Option<&ActorKey>,
        accept: &str,
    ) -> FederationResult<(Url, HttpResponse)> {
        let mut current = url.clone();
        let mut redirects = 0;

        loop {
            let mut headers = vec![
                ("Accept".to_string(), accept.to_string()),
                ("User-Agent".to_string(), self.user_agent.clone()),
            ];
            if let Some(key) = key {
                headers.extend(
                    self.signer
                        .sign(key, "GET", &current, None)
                        .map_err(ClientError::from)?,
                );
            }

            debug!(url = %current, signed = key.is_some(), "Fetching");
            let response = self
                .transport
                .send(HttpRequest {
                    method: Method::GET,
                    url: current.clone(),
                    headers,
                    body: None,
                })
                .await?;

            if response.is_redirect() {
                let Some(location) = response.header("location") else {
                    return Err(StatusError::new(response.status, "redirect without location").into());
                };
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    warn!(url = %url, "Too many redirects");
                    return Err(FederationError::TooManyRedirects(url.to_string()));
                }
                current = current
                    .join(location)
                    .map_err(|_| ClientError::InvalidUrl(location.to_string()))?;
                continue;
            }

            if !response.is_success() {
                return Err(response.status_error().into());
            }
            return Ok((current, response));
        }
    }

    /// Signed POST of an activity body. Redirects are not followed; the
    /// caller interprets the status.
    pub async fn post(
        &self,
        url: &Url,
        body: Vec<u8>,
        key: &ActorKey,
    ) -> Result<HttpResponse, ClientError> {
        let mut headers = vec![
            ("Content-Type".to_string(), AP_CONTENT_TYPE.to_string()),
            ("Accept".to_string(), AP_ACCEPT.to_string()),
            ("User-Agent".to_string(), self.user_agent.clone()),
        ];
        headers.extend(self.signer.sign(key, "POST", url, Some(&body))?);

        self.transport
            .send(HttpRequest {
                method: Method::POST,
                url: url.clone(),
                headers,
                body: Some(body),
            })
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeTransport, StubRequestSigner};
    use serde_json::json;

    fn client(transport: Arc<FakeTransport>) -> ApClient {
        ApClient::new(
            transport,
            Arc::new(StubRequestSigner),
            &Url::parse("https://local.example").unwrap(),
        )
    }

    fn key() -> ActorKey {
        ActorKey {
            key_id: "https://local.example/users/system#main-key".to_string(),
            private_key_pem: String::new(),
        }
    }

    #[test]
    fn test_content_types() {
        assert!(is_activitypub_content_type("application/activity+json; charset=utf-8"));
        assert!(is_activitypub_content_type(
            "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""
        ));
        assert!(!is_activitypub_content_type("application/ld+json"));
        assert!(!is_activitypub_content_type("text/html"));
    }

    #[tokio::test]
    async fn test_redirect_is_followed_and_resigned() {
        let transport = Arc::new(FakeTransport::new());
        transport.redirect("https://remote.example/a", "/b");
        transport.activity_json("https://remote.example/b", json!({"id": "https://remote.example/b"}));

        let (url, value) = client(transport.clone())
            .signed_get(&Url::parse("https://remote.example/a").unwrap(), Some(&key()))
            .await
            .unwrap();

        assert_eq!(url.as_str(), "https://remote.example/b");
        assert_eq!(value["id"], "https://remote.example/b");
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.header("signature").is_some()));
    }

    #[tokio::test]
    async fn test_fourth_redirect_fails() {
        let transport = Arc::new(FakeTransport::new());
        transport.redirect("https://remote.example/0", "https://remote.example/1");
        transport.redirect("https://remote.example/1", "https://remote.example/2");
        transport.redirect("https://remote.example/2", "https://remote.example/3");
        transport.redirect("https://remote.example/3", "https://remote.example/4");
        transport.activity_json("https://remote.example/4", json!({}));

        let err = client(transport.clone())
            .signed_get(&Url::parse("https://remote.example/0").unwrap(), Some(&key()))
            .await
            .unwrap_err();

        assert!(matches!(err, FederationError::TooManyRedirects(_)));
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_status_and_content_type_errors() {
        let transport = Arc::new(FakeTransport::new());
        transport.status("https://remote.example/gone", 410);
        transport.respond(
            "https://remote.example/html",
            200,
            vec![("content-type".to_string(), "text/html".to_string())],
            b"<html></html>".to_vec(),
        );
        let client = client(transport);

        let err = client
            .signed_get(&Url::parse("https://remote.example/gone").unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Status(ref s) if s.code == 410));

        let err = client
            .signed_get(&Url::parse("https://remote.example/html").unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::InvalidObject(_)));
    }

    #[tokio::test]
    async fn test_post_does_not_follow_redirects() {
        let transport = Arc::new(FakeTransport::new());
        transport.redirect("https://remote.example/inbox", "https://other.example/inbox");

        let response = client(transport.clone())
            .post(
                &Url::parse("https://remote.example/inbox").unwrap(),
                b"{}".to_vec(),
                &key(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 302);
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].header("content-type"), Some(AP_CONTENT_TYPE));
    }
}
