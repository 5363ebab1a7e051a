//! Inbox endpoints.
//!
//! Requests are checked only for a well-formed `Signature` header, a fresh
//! `Date` and a matching `Digest`, then queued. Signature verification and processing
//! happen in the inbox worker.

use std::collections::BTreeMap;
use std::sync::Arc;

use apkernel_common::{AppError, AppResult};
use axum::{
    Router,
    body::Bytes,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::jobs::{InboxJob, InboxQueue};
use crate::security::validate_date_header;
use crate::signature::{SignatureComponents, verify_digest};

#[derive(Clone)]
pub struct InboxState {
    pub queue: Arc<dyn InboxQueue>,
}

impl InboxState {
    #[must_use]
    pub fn new(queue: Arc<dyn InboxQueue>) -> Self {
        Self { queue }
    }
}

/// `POST /inbox` and `POST /users/{id}/inbox`.
pub fn inbox_router(state: InboxState) -> Router {
    Router::new()
        .route("/inbox", post(inbox_handler))
        .route("/users/{id}/inbox", post(user_inbox_handler))
        .with_state(state)
}

/// Shared inbox.
pub async fn inbox_handler(
    State(state): State<InboxState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);
    accept_activity(&state, path, &headers, &body).await
}

/// Per-user inbox. Handled exactly like the shared one.
pub async fn user_inbox_handler(
    State(state): State<InboxState>,
    Path(user_id): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    debug!(user_id = %user_id, "Activity posted to user inbox");
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);
    accept_activity(&state, path, &headers, &body).await
}

async fn accept_activity(
    state: &InboxState,
    path: String,
    headers: &HeaderMap,
    body: &[u8],
) -> AppResult<StatusCode> {
    let signature = header(headers, "signature")
        .ok_or_else(|| AppError::Unauthorized("missing signature".to_string()))?;
    let components = SignatureComponents::parse(signature)
        .map_err(|e| AppError::Unauthorized(e.to_string()))?;

    if let Some(date) = header(headers, "date") {
        validate_date_header(date, Utc::now()).map_err(|e| AppError::Unauthorized(e.to_string()))?;
    }

    let digest = header(headers, "digest")
        .ok_or_else(|| AppError::Unauthorized("missing digest".to_string()))?;
    if !verify_digest(body, digest) {
        return Err(AppError::Unauthorized("digest mismatch".to_string()));
    }

    let activity: Value =
        serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("invalid json: {e}")))?;
    if !activity.is_object() {
        return Err(AppError::BadRequest("activity must be an object".to_string()));
    }

    let headers: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();

    let activity_type = activity
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("?")
        .to_string();
    let job = InboxJob::new(activity, "POST", path, headers);
    info!(
        job_id = %job.id,
        key_id = %components.key_id,
        activity_type = %activity_type,
        "Queued inbound activity"
    );
    state
        .queue
        .enqueue(job, None)
        .await
        .map_err(|e| AppError::Queue(e.to_string()))?;

    Ok(StatusCode::ACCEPTED)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::jobs::MemoryInboxQueue;
    use crate::signature::calculate_digest;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    const SIGNATURE: &str = r#"keyId="https://remote.example/users/alice#main-key",headers="(request-target) host date digest",signature="c2ln""#;

    fn request(path: &str, body: &str, digest: Option<String>, signature: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("host", "local.example")
            .header("content-type", "application/activity+json");
        if let Some(digest) = digest {
            builder = builder.header("digest", digest);
        }
        if let Some(signature) = signature {
            builder = builder.header("signature", signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn setup() -> (Router, Arc<MemoryInboxQueue>) {
        let queue = Arc::new(MemoryInboxQueue::new());
        (inbox_router(InboxState::new(queue.clone())), queue)
    }

    #[tokio::test]
    async fn test_signed_activity_is_queued() {
        let (app, queue) = setup();
        let body = json!({"type": "Follow", "actor": "https://remote.example/users/alice"}).to_string();

        let response = app
            .oneshot(request(
                "/users/bob1/inbox?x=1",
                &body,
                Some(calculate_digest(body.as_bytes())),
                Some(SIGNATURE),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let jobs = queue.jobs();
        assert_eq!(jobs.len(), 1);
        let (job, delay) = &jobs[0];
        assert!(delay.is_none());
        assert_eq!(job.path, "/users/bob1/inbox?x=1");
        assert_eq!(job.headers.get("signature").map(String::as_str), Some(SIGNATURE));
        assert_eq!(job.activity["type"], "Follow");
    }

    #[tokio::test]
    async fn test_unsigned_or_tampered_requests_are_refused() {
        let body = json!({"type": "Follow"}).to_string();

        let (app, queue) = setup();
        let response = app
            .oneshot(request("/inbox", &body, Some(calculate_digest(body.as_bytes())), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let (app, _) = setup();
        let response = app
            .oneshot(request("/inbox", &body, Some(calculate_digest(b"other")), Some(SIGNATURE)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let (app, _) = setup();
        let mut stale = request("/inbox", &body, Some(calculate_digest(body.as_bytes())), Some(SIGNATURE));
        let sent_at = (chrono::Utc::now() - chrono::Duration::minutes(10)).to_rfc2822();
        stale
            .headers_mut()
            .insert("date", sent_at.parse().unwrap());
        let response = app.oneshot(stale).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let (app, _) = setup();
        let response = app
            .oneshot(request("/inbox", "not json", Some(calculate_digest(b"not json")), Some(SIGNATURE)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(queue.jobs().is_empty());
    }
}
