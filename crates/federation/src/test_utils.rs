//! Test fixtures: a scripted HTTP transport, stub signers, and a fully wired
//! in-memory federation context.

#![allow(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use apkernel_common::FederationConfig;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use url::Url;

use crate::client::{ClientError, HttpRequest, HttpResponse, HttpTransport};
use crate::context::{FederationContext, FederationDeps};
use crate::events::EventBus;
use crate::jobs::{MemoryAccountJobQueue, MemoryDeliveryQueue};
use crate::ld_signature::LdSigner;
use crate::lock::MemoryLeaseStore;
use crate::signature::{
    ActorKey, RequestSigner, SignatureComponents, SignatureError, SignatureVerifier,
};
use crate::store::{
    Domain, MemoryDomain, Note, PublicKeyInfo, User, UserKeypair, UserStore, Visibility,
};

/// Origin of the server under test.
pub const TEST_ORIGIN: &str = "https://local.example";

#[derive(Debug, Clone)]
enum Scripted {
    Response(HttpResponse),
    Error(String),
}

/// [`HttpTransport`] answering from a per-URL script.
///
/// Responses queued for a URL are served in order; the last one repeats.
/// Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, url: &str, scripted: Scripted) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_default()
            .push_back(scripted);
    }

    pub fn respond(&self, url: &str, status: u16, headers: Vec<(String, String)>, body: Vec<u8>) {
        self.push(
            url,
            Scripted::Response(HttpResponse {
                status,
                headers,
                body,
            }),
        );
    }

    pub fn status(&self, url: &str, status: u16) {
        self.respond(url, status, Vec::new(), Vec::new());
    }

    /// Serve `value` as `application/activity+json`.
    pub fn activity_json(&self, url: &str, value: Value) {
        self.respond(
            url,
            200,
            vec![(
                "content-type".to_string(),
                "application/activity+json; charset=utf-8".to_string(),
            )],
            value.to_string().into_bytes(),
        );
    }

    /// Serve `value` as `application/json`.
    pub fn json(&self, url: &str, value: Value) {
        self.respond(
            url,
            200,
            vec![("content-type".to_string(), "application/json".to_string())],
            value.to_string().into_bytes(),
        );
    }

    pub fn redirect(&self, url: &str, location: &str) {
        self.respond(
            url,
            302,
            vec![("location".to_string(), location.to_string())],
            Vec::new(),
        );
    }

    /// Fail the request at the transport level.
    pub fn fail(&self, url: &str, message: &str) {
        self.push(url, Scripted::Error(message.to_string()));
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Requests received for `url`.
    #[must_use]
    pub fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.as_str() == url)
            .collect()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
        let url = request.url.to_string();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let scripted = {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            routes.get_mut(&url).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            })
        };

        match scripted {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::Error(message)) => Err(ClientError::Transport(message)),
            None => Ok(HttpResponse {
                status: 404,
                headers: Vec::new(),
                body: Vec::new(),
            }),
        }
    }
}

/// Adds a recognizable `Signature` header without any cryptography.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubRequestSigner;

impl RequestSigner for StubRequestSigner {
    fn sign(
        &self,
        key: &ActorKey,
        method: &str,
        url: &Url,
        _body: Option<&[u8]>,
    ) -> Result<Vec<(String, String)>, SignatureError> {
        Ok(vec![(
            "Signature".to_string(),
            format!("keyId=\"{}\",signature=\"stub {method} {url}\"", key.key_id),
        )])
    }
}

/// Accepts `Signature` headers whose signature value is `valid`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubSignatureVerifier;

impl SignatureVerifier for StubSignatureVerifier {
    fn verify(
        &self,
        _public_key_pem: &str,
        components: &SignatureComponents,
        _method: &str,
        _path: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<bool, SignatureError> {
        Ok(components.signature == "valid")
    }
}

/// Attaches a placeholder `signature` block naming the creator.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubLdSigner;

impl LdSigner for StubLdSigner {
    fn sign(&self, mut document: Value, key: &ActorKey) -> Result<Value, SignatureError> {
        document["signature"] = json!({
            "type": "RsaSignature2017",
            "creator": key.key_id,
            "signatureValue": "stub",
        });
        Ok(document)
    }

    fn verify(&self, document: &Value, _public_key_pem: &str) -> Result<bool, SignatureError> {
        Ok(document["signature"]["signatureValue"] == "stub")
    }
}

/// Actor JSON of a remote user served by [`FakeTransport`].
#[must_use]
pub fn remote_actor_json(host: &str, username: &str) -> Value {
    let id = format!("https://{host}/users/{username}");
    json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": id,
        "type": "Person",
        "preferredUsername": username,
        "inbox": format!("{id}/inbox"),
        "endpoints": {"sharedInbox": format!("https://{host}/inbox")},
        "followers": format!("{id}/followers"),
        "featured": format!("{id}/collections/featured"),
        "publicKey": {
            "id": format!("{id}#main-key"),
            "owner": id,
            "publicKeyPem": "-----BEGIN PUBLIC KEY-----\nstub\n-----END PUBLIC KEY-----"
        }
    })
}

/// Note JSON by a remote user served by [`FakeTransport`].
#[must_use]
pub fn remote_note_json(host: &str, username: &str, id: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("https://{host}/notes/{id}"),
        "type": "Note",
        "attributedTo": format!("https://{host}/users/{username}"),
        "content": "<p>hello</p>",
        "to": ["https://www.w3.org/ns/activitystreams#Public"],
        "cc": [format!("https://{host}/users/{username}/followers")]
    })
}

/// A remote user as the store would hold it.
#[must_use]
pub fn remote_user(id: &str, host: &str, username: &str) -> User {
    let uri = format!("https://{host}/users/{username}");
    User {
        host: Some(host.to_string()),
        uri: Url::parse(&uri).ok(),
        inbox: Url::parse(&format!("{uri}/inbox")).ok(),
        shared_inbox: Url::parse(&format!("https://{host}/inbox")).ok(),
        followers_uri: Url::parse(&format!("{uri}/followers")).ok(),
        featured: Url::parse(&format!("{uri}/collections/featured")).ok(),
        last_fetched_at: Some(Utc::now()),
        ..User::new_local(id, username)
    }
}

/// Public key info matching [`remote_actor_json`].
#[must_use]
pub fn remote_key(host: &str, username: &str) -> PublicKeyInfo {
    PublicKeyInfo {
        key_id: format!("https://{host}/users/{username}#main-key"),
        key_pem: "-----BEGIN PUBLIC KEY-----\nstub\n-----END PUBLIC KEY-----".to_string(),
    }
}

/// A wired federation context over in-memory fakes.
pub struct TestFederation {
    pub ctx: FederationContext,
    pub store: Arc<MemoryDomain>,
    pub transport: Arc<FakeTransport>,
    pub leases: Arc<MemoryLeaseStore>,
    pub deliveries: Arc<MemoryDeliveryQueue>,
    pub account_jobs: Arc<MemoryAccountJobQueue>,
}

impl TestFederation {
    pub async fn new() -> Self {
        Self::with_config(FederationConfig::default()).await
    }

    /// Origin is [`TEST_ORIGIN`]; the instance actor gets a dummy keypair.
    pub async fn with_config(config: FederationConfig) -> Self {
        let store = Arc::new(MemoryDomain::new());
        let transport = Arc::new(FakeTransport::new());
        let leases = Arc::new(MemoryLeaseStore::new());
        let deliveries = Arc::new(MemoryDeliveryQueue::new());
        let account_jobs = Arc::new(MemoryAccountJobQueue::new());

        if let Ok(actor) = UserStore::instance_actor(store.as_ref()).await {
            store.insert_keypair(dummy_keypair(&actor.id)).await;
        }

        let origin = Url::parse(TEST_ORIGIN).unwrap_or_else(|_| unreachable!());
        let ctx = FederationContext::new(
            origin,
            config,
            FederationDeps {
                domain: Domain::in_memory(&store),
                transport: transport.clone(),
                request_signer: Arc::new(StubRequestSigner),
                ld_signer: Arc::new(StubLdSigner),
                lease_store: leases.clone(),
                delivery_queue: deliveries.clone(),
                account_jobs: account_jobs.clone(),
                events: EventBus::new(),
            },
        );

        Self {
            ctx,
            store,
            transport,
            leases,
            deliveries,
            account_jobs,
        }
    }

    /// Insert a local user with a dummy keypair.
    pub async fn local_user(&self, id: &str, username: &str) -> User {
        let user = User::new_local(id, username);
        self.store.insert_user(user.clone()).await;
        self.store.insert_keypair(dummy_keypair(id)).await;
        user
    }

    /// Insert a remote user.
    pub async fn remote_user(&self, id: &str, host: &str, username: &str) -> User {
        let user = remote_user(id, host, username);
        self.store.insert_user(user.clone()).await;
        user
    }

    /// Insert a public note by `user_id`, remote when `uri` is given.
    pub async fn note(&self, id: &str, user_id: &str, uri: Option<&str>) -> Note {
        let note = Note {
            id: id.to_string(),
            uri: uri.and_then(|u| Url::parse(u).ok()),
            user_id: user_id.to_string(),
            text: Some("hello".to_string()),
            cw: None,
            visibility: Visibility::Public,
            visible_user_ids: Vec::new(),
            reply_id: None,
            renote_id: None,
            mentions: Vec::new(),
            tags: Vec::new(),
            emojis: Vec::new(),
            file_urls: Vec::new(),
            poll: None,
            created_at: Utc::now(),
        };
        self.store.insert_note(note.clone()).await;
        note
    }
}

fn dummy_keypair(user_id: &str) -> UserKeypair {
    UserKeypair {
        user_id: user_id.to_string(),
        public_key_pem: String::new(),
        private_key_pem: String::new(),
    }
}
