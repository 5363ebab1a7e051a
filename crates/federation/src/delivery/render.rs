//! Rendering of outgoing activities and local objects.

use std::sync::Arc;

use apkernel_common::IdGenerator;
use serde_json::{Value, json};
use url::Url;

use crate::error::FederationResult;
use crate::ld_signature::LdSigner;
use crate::objects::{AS_CONTEXT, public_audience};
use crate::signature::ActorKey;
use crate::store::{Note, User, UserKeypair, Visibility, local_url};

/// The `@context` attached to every outgoing activity.
#[must_use]
pub fn context() -> Value {
    json!([
        AS_CONTEXT,
        "https://w3id.org/security/v1",
        {
            "Key": "sec:Key",
            "manuallyApprovesFollowers": "as:manuallyApprovesFollowers",
            "sensitive": "as:sensitive",
            "Hashtag": "as:Hashtag",
            "quoteUrl": "as:quoteUrl",
            "misskey": "https://misskey-hub.net/ns#",
            "_misskey_content": "misskey:_misskey_content",
            "_misskey_quote": "misskey:_misskey_quote",
            "_misskey_reaction": "misskey:_misskey_reaction",
            "_misskey_votes": "misskey:_misskey_votes",
            "isCat": "misskey:isCat"
        }
    ])
}

/// Builds activities on behalf of local users.
#[derive(Clone)]
pub struct ApRenderer {
    origin: Url,
    id_gen: IdGenerator,
    ld_signer: Arc<dyn LdSigner>,
}

impl ApRenderer {
    #[must_use]
    pub fn new(origin: Url, ld_signer: Arc<dyn LdSigner>) -> Self {
        Self {
            origin,
            id_gen: IdGenerator::new(),
            ld_signer,
        }
    }

    #[must_use]
    pub const fn origin(&self) -> &Url {
        &self.origin
    }

    /// Key id and private key a local user signs with.
    #[must_use]
    pub fn actor_key(&self, user: &User, keypair: &UserKeypair) -> ActorKey {
        ActorKey {
            key_id: format!("{}#main-key", user.ap_id(&self.origin)),
            private_key_pem: keypair.private_key_pem.clone(),
        }
    }

    /// Attach `@context` and an id when the activity has none.
    #[must_use]
    pub fn render_activity(&self, mut activity: Value) -> Value {
        if let Value::Object(map) = &mut activity {
            map.insert("@context".to_string(), context());
            if !map.get("id").is_some_and(Value::is_string) {
                map.insert(
                    "id".to_string(),
                    Value::from(self.id_gen.activity_id(&self.origin)),
                );
            }
        }
        activity
    }

    /// LD-sign the outer activity. Embedded objects are left unsigned.
    pub fn sign(&self, activity: Value, key: &ActorKey) -> FederationResult<Value> {
        Ok(self.ld_signer.sign(activity, key)?)
    }

    /// Id of the Follow from `follower` to `followee`.
    #[must_use]
    pub fn follow_id(&self, follower: &User, followee: &User) -> Url {
        local_url(
            &self.origin,
            &format!("/follows/{}/{}", follower.id, followee.id),
        )
    }

    #[must_use]
    pub fn render_follow(&self, follower: &User, followee: &User, request_id: Option<&Url>) -> Value {
        let id = request_id
            .cloned()
            .unwrap_or_else(|| self.follow_id(follower, followee));
        json!({
            "id": id,
            "type": "Follow",
            "actor": follower.ap_id(&self.origin),
            "object": followee.ap_id(&self.origin),
        })
    }

    #[must_use]
    pub fn render_accept(&self, object: Value, actor: &User) -> Value {
        json!({
            "type": "Accept",
            "actor": actor.ap_id(&self.origin),
            "object": object,
        })
    }

    #[must_use]
    pub fn render_reject(&self, object: Value, actor: &User) -> Value {
        json!({
            "type": "Reject",
            "actor": actor.ap_id(&self.origin),
            "object": object,
        })
    }

    #[must_use]
    pub fn render_undo(&self, object: Value, actor: &User) -> Value {
        json!({
            "type": "Undo",
            "actor": actor.ap_id(&self.origin),
            "object": object,
        })
    }

    /// Flag sent to a remote instance. The actor is always the instance
    /// system actor so the reporter stays anonymous.
    #[must_use]
    pub fn render_flag(
        &self,
        instance_actor: &User,
        target: &Url,
        object_uris: &[Url],
        comment: &str,
    ) -> Value {
        let mut objects = vec![Value::from(target.as_str())];
        objects.extend(object_uris.iter().map(|u| Value::from(u.as_str())));
        json!({
            "type": "Flag",
            "actor": instance_actor.ap_id(&self.origin),
            "content": comment,
            "object": objects,
        })
    }

    #[must_use]
    pub fn render_person(&self, user: &User, public_key_pem: Option<&str>) -> Value {
        let id = user.ap_id(&self.origin);
        let mut person = json!({
            "@context": context(),
            "id": id,
            "type": if user.is_bot { "Service" } else { "Person" },
            "preferredUsername": user.username,
            "name": user.name,
            "inbox": local_url(&self.origin, &format!("/users/{}/inbox", user.id)),
            "outbox": local_url(&self.origin, &format!("/users/{}/outbox", user.id)),
            "followers": local_url(&self.origin, &format!("/users/{}/followers", user.id)),
            "following": local_url(&self.origin, &format!("/users/{}/following", user.id)),
            "featured": local_url(&self.origin, &format!("/users/{}/collections/featured", user.id)),
            "endpoints": { "sharedInbox": local_url(&self.origin, "/inbox") },
            "manuallyApprovesFollowers": user.is_locked,
            "alsoKnownAs": user.also_known_as,
        });
        if let Some(target) = &user.moved_to_uri {
            person["movedTo"] = Value::from(target.as_str());
        }
        if let Some(pem) = public_key_pem {
            person["publicKey"] = json!({
                "id": format!("{id}#main-key"),
                "type": "Key",
                "owner": id,
                "publicKeyPem": pem,
            });
        }
        person
    }

    #[must_use]
    pub fn render_note(&self, note: &Note, author: &User) -> Value {
        let author_id = author.ap_id(&self.origin);
        let followers = local_url(&self.origin, &format!("/users/{}/followers", author.id));
        let public = public_audience();

        let (to, cc): (Vec<Value>, Vec<Value>) = match note.visibility {
            Visibility::Public => (vec![json!(public)], vec![json!(followers)]),
            Visibility::Home => (vec![json!(followers)], vec![json!(public)]),
            Visibility::Followers => (vec![json!(followers)], Vec::new()),
            Visibility::Specified => (Vec::new(), Vec::new()),
        };

        let id = note
            .uri
            .clone()
            .unwrap_or_else(|| local_url(&self.origin, &format!("/notes/{}", note.id)));
        json!({
            "@context": context(),
            "id": id,
            "type": if note.poll.is_some() { "Question" } else { "Note" },
            "attributedTo": author_id,
            "content": note.text,
            "_misskey_content": note.text,
            "summary": note.cw,
            "published": note.created_at.to_rfc3339(),
            "to": to,
            "cc": cc,
        })
    }
}
