use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Prefix that `owner/name` shorthands expand against.
pub const DEFAULT_REMOTE_BASE: &str = "git@github.com:";

const SHORTHAND_PATTERN: &str = r"^[^/\s@]+/[^/\s]+$";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemoteSpecError {
    #[error("Remote spec is empty")]
    Empty,

    #[error("Remote spec contains whitespace: {0:?}")]
    Whitespace(String),
}

/// The `repo` field of a manifest entry, resolved to a fetchable URL and a
/// stable canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteSpec {
    raw: String,
    url: String,
    name: String,
}

impl RemoteSpec {
    pub fn parse(spec: &str, remote_base: &str) -> Result<Self, RemoteSpecError> {
        let raw = spec.trim();
        if raw.is_empty() {
            return Err(RemoteSpecError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(RemoteSpecError::Whitespace(raw.to_string()));
        }

        let url = if Self::is_shorthand(raw) {
            format!("{remote_base}{raw}")
        } else {
            raw.to_string()
        };
        let name = canonical_name(&url);

        Ok(Self {
            raw: raw.to_string(),
            url,
            name,
        })
    }

    /// `owner/name` with no scheme, host or user part.
    pub fn is_shorthand(spec: &str) -> bool {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        PATTERN
            .get_or_init(|| Regex::new(SHORTHAND_PATTERN).ok())
            .as_ref()
            .map_or(false, |re| re.is_match(spec) && !spec.starts_with('.'))
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RemoteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Strip scheme, user and `.git` so that every spelling of a remote maps
/// to the same `host/owner/name` identity.
pub fn canonical_name(url: &str) -> String {
    let body = if url.contains("://") {
        match Url::parse(url) {
            Ok(parsed) => {
                let host = parsed.host_str().unwrap_or_default();
                format!("{host}{}", parsed.path())
            }
            Err(_) => url.split_once("://").map_or(url, |(_, rest)| rest).to_string(),
        }
    } else {
        let without_user = match url.split_once('@') {
            Some((user, rest)) if !user.contains('/') && !user.contains(':') => rest,
            _ => url,
        };
        match without_user.split_once(':') {
            Some((host, path)) if !host.contains('/') => format!("{host}/{path}"),
            _ => without_user.to_string(),
        }
    };

    let trimmed = body
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    trimmed
        .strip_suffix(".git")
        .unwrap_or(trimmed)
        .to_string()
}
