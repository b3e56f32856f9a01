//! Image reference helpers for the internal registry.
//!
//! User images live under `<registry>/images/<name>`; build results are
//! pushed to `<registry>/digests` so they can be addressed by digest.

use std::sync::OnceLock;

use regex::Regex;

const DIGEST_PREFIX: &str = "sha256:";

fn port_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r":([0-9]+/)").expect("static pattern"))
}

/// Escape a `host:port/` prefix to `host_port/` so the name nests under a
/// repository path. Tags (`name:tag`) are left alone.
pub fn escape_port(name: &str) -> String {
    port_pattern().replace_all(name, "_${1}").into_owned()
}

/// Whether `name` is a bare image digest such as `sha256:ab12...`.
pub fn is_digest(name: &str) -> bool {
    name.starts_with(DIGEST_PREFIX)
}

/// Join a repository and tag, defaulting the tag to `latest`.
pub fn with_tag(repository: &str, tag: &str) -> String {
    let tag = if tag.is_empty() { "latest" } else { tag };
    format!("{}:{}", repository, tag)
}

/// Naming scheme of the in-cluster registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalRegistry {
    host: String,
}

impl InternalRegistry {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Location of a user-named image.
    pub fn image(&self, name: &str) -> String {
        format!("{}/images/{}", self.host, escape_port(name))
    }

    /// Repository that receives every build result.
    pub fn digests(&self) -> String {
        format!("{}/digests", self.host)
    }

    /// Location of a build result addressed by digest.
    pub fn digest(&self, digest: &str) -> String {
        format!("{}/digests@{}", self.host, digest)
    }

    /// Where a tag request copies from: by digest when `name` is one,
    /// otherwise by name.
    pub fn tag_source(&self, name: &str) -> String {
        if is_digest(name) {
            self.digest(name)
        } else {
            self.image(name)
        }
    }
}
