//! ID generation utilities.

use ulid::Ulid;
use url::Url;
use uuid::Uuid;

/// ID generator for entities and locally minted activity ids.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new ULID-based entity ID.
    ///
    /// ULIDs sort lexicographically by creation time.
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate a new random UUID v4.
    #[must_use]
    pub fn generate_uuid_v4(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Generate an opaque owner token (used for lock leases).
    #[must_use]
    pub fn generate_token(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Mint an activity id under `origin`: `<origin>/<uuid>`.
    #[must_use]
    pub fn activity_id(&self, origin: &Url) -> String {
        format!("{}/{}", origin.as_str().trim_end_matches('/'), self.generate_uuid_v4())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ulid() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.generate();
        let id2 = id_gen.generate();

        assert_eq!(id1.len(), 26);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_generate_token() {
        let token = IdGenerator::new().generate_token();
        assert_eq!(token.len(), 32);
    }

    #[test]
    fn test_activity_id_under_origin() {
        let origin = Url::parse("https://example.com/").unwrap();
        let id = IdGenerator::new().activity_id(&origin);

        assert!(id.starts_with("https://example.com/"));
        assert!(!id.starts_with("https://example.com//"));
        assert_eq!(id.len(), "https://example.com/".len() + 36);
    }
}
