//! Push event parsing.
//!
//! Only pushes to the publishing-source branch start a run. Everything
//! else in the payload is ignored.

use serde::Deserialize;
use thiserror::Error;

use crate::pipeline::BuildRequest;
use crate::types::{InvalidRepoKey, RepoKey};

/// A push to the publishing-source branch of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub key: RepoKey,
    pub clone_url: String,

    /// The commit the branch now points at, when GitHub sent it.
    pub head: Option<String>,
}

impl PushNotification {
    pub fn into_request(self) -> BuildRequest {
        BuildRequest {
            key: self.key,
            clone_url: self.clone_url,
        }
    }
}

/// Errors for push payloads that cannot be interpreted at all.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid repository name: {0}")]
    InvalidRepository(#[from] InvalidRepoKey),

    #[error("push payload has no clone URL")]
    MissingCloneUrl,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    deleted: bool,
    repository: RepositoryPayload,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: String,
    #[serde(default)]
    clone_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Returns the notification for a push to `source_branch`, or `None` if the
/// push went to another ref or deleted the branch.
pub fn parse_push(
    body: &[u8],
    source_branch: &str,
) -> Result<Option<PushNotification>, PayloadError> {
    let payload: PushPayload = serde_json::from_slice(body)?;

    let expected_ref = format!("refs/heads/{}", source_branch);
    if payload.git_ref != expected_ref || payload.deleted {
        return Ok(None);
    }

    let key = RepoKey::parse(&payload.repository.full_name)?;
    let clone_url = payload
        .repository
        .clone_url
        .or(payload.repository.url)
        .filter(|url| !url.is_empty())
        .ok_or(PayloadError::MissingCloneUrl)?;

    Ok(Some(PushNotification {
        key,
        clone_url,
        head: payload.after,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn push_body(git_ref: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "ref": git_ref,
            "after": "2f3c0d1e",
            "deleted": false,
            "repository": {
                "id": 42,
                "full_name": "acme/site",
                "clone_url": "https://github.com/acme/site.git",
                "url": "https://github.com/acme/site"
            }
        }))
        .unwrap()
    }

    #[test]
    fn push_to_source_branch_is_accepted() {
        let push = parse_push(&push_body("refs/heads/hugo-pages"), "hugo-pages")
            .unwrap()
            .unwrap();
        assert_eq!(push.key.to_string(), "acme/site");
        assert_eq!(push.clone_url, "https://github.com/acme/site.git");
        assert_eq!(push.head.as_deref(), Some("2f3c0d1e"));
    }

    #[test]
    fn push_to_other_refs_is_ignored() {
        for git_ref in ["refs/heads/main", "refs/tags/hugo-pages", "refs/heads/hugo-pages-old"] {
            assert_eq!(parse_push(&push_body(git_ref), "hugo-pages").unwrap(), None);
        }
    }

    #[test]
    fn branch_deletion_is_ignored() {
        let body = serde_json::to_vec(&json!({
            "ref": "refs/heads/hugo-pages",
            "deleted": true,
            "repository": { "full_name": "acme/site", "clone_url": "https://github.com/acme/site.git" }
        }))
        .unwrap();
        assert_eq!(parse_push(&body, "hugo-pages").unwrap(), None);
    }

    #[test]
    fn falls_back_to_repository_url() {
        let body = serde_json::to_vec(&json!({
            "ref": "refs/heads/hugo-pages",
            "repository": { "full_name": "acme/site", "url": "https://github.com/acme/site" }
        }))
        .unwrap();
        let push = parse_push(&body, "hugo-pages").unwrap().unwrap();
        assert_eq!(push.clone_url, "https://github.com/acme/site");
    }

    #[test]
    fn missing_clone_url_is_an_error() {
        let body = serde_json::to_vec(&json!({
            "ref": "refs/heads/hugo-pages",
            "repository": { "full_name": "acme/site" }
        }))
        .unwrap();
        assert!(matches!(
            parse_push(&body, "hugo-pages"),
            Err(PayloadError::MissingCloneUrl)
        ));
    }

    #[test]
    fn malformed_bodies_are_errors() {
        assert!(matches!(parse_push(b"not json", "hugo-pages"), Err(PayloadError::InvalidJson(_))));
        assert!(matches!(parse_push(b"{}", "hugo-pages"), Err(PayloadError::InvalidJson(_))));

        let body = serde_json::to_vec(&json!({
            "ref": "refs/heads/hugo-pages",
            "repository": { "full_name": "../etc", "clone_url": "https://x/y.git" }
        }))
        .unwrap();
        assert!(matches!(
            parse_push(&body, "hugo-pages"),
            Err(PayloadError::InvalidRepository(_))
        ));
    }

    proptest! {
        #[test]
        fn arbitrary_bodies_never_panic(body: Vec<u8>) {
            let _ = parse_push(&body, "hugo-pages");
        }
    }
}
