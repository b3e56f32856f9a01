//! Registry credential documents.
//!
//! Docker clients send registry credentials per request, base64-encoded JSON
//! in `X-Registry-Auth` (one registry) or `X-Registry-Config` (many). Both are
//! normalized into a [`DockerConfig`], the `config.json` document that skopeo
//! and buildkit read from disk.

use std::collections::BTreeMap;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{FerryError, Result};

/// One credential entry, the base64 of `user:password`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerAuth {
    pub auth: String,
}

/// A `config.json` credentials document keyed by registry server address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerConfig {
    pub auths: BTreeMap<String, DockerAuth>,
}

impl DockerConfig {
    /// Add basic credentials for a registry.
    pub fn insert_basic(&mut self, server: &str, username: &str, password: &str) {
        let auth = STANDARD.encode(format!("{}:{}", username, password));
        self.auths.insert(server.to_string(), DockerAuth { auth });
    }

    /// Whether no registry is configured.
    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }

    /// Encode the document as compact JSON.
    ///
    /// The document only holds strings, so encoding cannot fail.
    pub fn to_json(&self) -> String {
        let mut auths = Map::new();
        for (server, entry) in &self.auths {
            let mut inner = Map::new();
            inner.insert("auth".to_string(), Value::String(entry.auth.clone()));
            auths.insert(server.clone(), Value::Object(inner));
        }
        let mut root = Map::new();
        root.insert("auths".to_string(), Value::Object(auths));
        Value::Object(root).to_string()
    }
}

/// A single credential as sent by the Docker CLI.
#[derive(Debug, Default, Deserialize)]
struct RegistryCredential {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    serveraddress: String,
    #[serde(default)]
    auth: String,
}

impl RegistryCredential {
    fn is_empty(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.serveraddress.is_empty()
            && self.auth.is_empty()
    }

    fn add_to(&self, config: &mut DockerConfig, fallback_server: &str) {
        let server = if self.serveraddress.is_empty() {
            fallback_server
        } else {
            self.serveraddress.as_str()
        };
        if self.username.is_empty() && self.password.is_empty() && !self.auth.is_empty() {
            config.auths.insert(
                server.to_string(),
                DockerAuth {
                    auth: self.auth.clone(),
                },
            );
        } else {
            config.insert_basic(server, &self.username, &self.password);
        }
    }
}

/// The `X-Registry-Auth` header: one credential for one registry.
#[derive(Debug, Clone)]
pub struct RegistryAuthHeader(pub String);

impl RegistryAuthHeader {
    /// Decode into a credentials document. An absent, empty or `null` header
    /// yields an empty document.
    pub fn to_docker_config(&self) -> Result<DockerConfig> {
        let mut config = DockerConfig::default();
        let Some(json) = decode_header(&self.0)? else {
            return Ok(config);
        };

        let credential: Option<RegistryCredential> = serde_json::from_slice(&json)
            .map_err(|e| {
                FerryError::Credentials(format!("unmarshal registry authentication: {}", e))
            })?;

        if let Some(credential) = credential.filter(|c| !c.is_empty()) {
            credential.add_to(&mut config, "");
        }
        Ok(config)
    }
}

/// The `X-Registry-Config` header: credentials for many registries.
#[derive(Debug, Clone)]
pub struct RegistryConfigHeader(pub String);

impl RegistryConfigHeader {
    /// Decode into a credentials document. An absent, empty or `null` header
    /// yields an empty document.
    pub fn to_docker_config(&self) -> Result<DockerConfig> {
        let mut config = DockerConfig::default();
        let Some(json) = decode_header(&self.0)? else {
            return Ok(config);
        };

        let credentials: Option<BTreeMap<String, RegistryCredential>> =
            serde_json::from_slice(&json).map_err(|e| {
                FerryError::Credentials(format!("unmarshal registry authentications: {}", e))
            })?;

        for (registry, credential) in credentials.unwrap_or_default() {
            if !credential.is_empty() {
                credential.add_to(&mut config, &registry);
            }
        }
        Ok(config)
    }
}

/// Base64-decode a header value. Docker uses URL-safe base64, older clients
/// the standard alphabet; both are accepted with or without padding.
fn decode_header(value: &str) -> Result<Option<Vec<u8>>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let decoded = [&URL_SAFE, &STANDARD]
        .iter()
        .find_map(|engine| engine.decode(value).ok())
        .or_else(|| {
            [&URL_SAFE_NO_PAD, &STANDARD_NO_PAD]
                .iter()
                .find_map(|engine| engine.decode(value.trim_end_matches('=')).ok())
        })
        .ok_or_else(|| {
            FerryError::Credentials("decode registry authentication: invalid base64".to_string())
        })?;

    Ok(Some(decoded))
}
