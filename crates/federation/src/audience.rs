//! Mapping of `to`/`cc` addressing onto note visibility.

use url::Url;

use crate::objects::is_public_audience;
use crate::store::Visibility;

/// Visibility of an inbound post plus the explicitly addressed actors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Audience {
    pub visibility: Visibility,
    /// Addressed URIs other than the public and followers collections.
    pub visible_uris: Vec<Url>,
}

/// Derive visibility from addressing.
///
/// Public in `to` is public, public only in `cc` is home, the author's
/// followers collection makes it followers-only, and anything else is a
/// direct post to the addressed actors.
#[must_use]
pub fn parse_audience(to: &[Url], cc: &[Url], followers_uri: Option<&Url>) -> Audience {
    let is_followers = |u: &Url| {
        followers_uri.is_some_and(|f| f == u) || u.path().ends_with("/followers")
    };

    let visibility = if to.iter().any(is_public_audience) {
        Visibility::Public
    } else if cc.iter().any(is_public_audience) {
        Visibility::Home
    } else if to.iter().chain(cc).any(is_followers) {
        Visibility::Followers
    } else {
        Visibility::Specified
    };

    let mut visible_uris: Vec<Url> = Vec::new();
    for uri in to.iter().chain(cc) {
        if is_public_audience(uri) || is_followers(uri) || visible_uris.contains(uri) {
            continue;
        }
        visible_uris.push(uri.clone());
    }

    Audience {
        visibility,
        visible_uris,
    }
}
