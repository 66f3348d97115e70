//! Decoration config: per-job knobs handed to the execution backend.
//!
//! A job's decoration config may be incomplete; [`DecorationConfig::apply_default`]
//! merges it field by field against a site-wide default ("use self if set,
//! else use default"), recursing into the nested sub-structures.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{PathError, StoragePath};

/// The four images the execution backend wraps around the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UtilityImages {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clonerefs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initupload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<String>,
}

impl UtilityImages {
    pub fn apply_default(&self, def: &UtilityImages) -> UtilityImages {
        UtilityImages {
            clonerefs: self.clonerefs.clone().or_else(|| def.clonerefs.clone()),
            initupload: self.initupload.clone().or_else(|| def.initupload.clone()),
            entrypoint: self.entrypoint.clone().or_else(|| def.entrypoint.clone()),
            sidecar: self.sidecar.clone().or_else(|| def.sidecar.clone()),
        }
    }

    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.clonerefs.as_deref().unwrap_or("").is_empty() {
            missing.push("clonerefs");
        }
        if self.initupload.as_deref().unwrap_or("").is_empty() {
            missing.push("initupload");
        }
        if self.entrypoint.as_deref().unwrap_or("").is_empty() {
            missing.push("entrypoint");
        }
        if self.sidecar.as_deref().unwrap_or("").is_empty() {
            missing.push("sidecar");
        }
        missing
    }
}

/// Per-resource requests and limits for the utility containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

impl Resources {
    pub fn apply_default(&self, def: &Resources) -> Resources {
        Resources {
            requests: if self.requests.is_empty() {
                def.requests.clone()
            } else {
                self.requests.clone()
            },
            limits: if self.limits.is_empty() {
                def.limits.clone()
            } else {
                self.limits.clone()
            },
        }
    }
}

/// The rule that maps (org, repo) to a segment of the artifact-store path.
/// This is the CANONICAL definition - use this everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathStrategy {
    /// `<repo>` when the org matches the default, `<org>_<repo>` otherwise.
    Legacy,
    /// The default org/repo pair is omitted; everything else is `<org>_<repo>`.
    Single,
    /// Always `<org>_<repo>`.
    Explicit,
}

impl PathStrategy {
    pub const ALL: &'static [PathStrategy] = &[
        PathStrategy::Legacy,
        PathStrategy::Single,
        PathStrategy::Explicit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PathStrategy::Legacy => "legacy",
            PathStrategy::Single => "single",
            PathStrategy::Explicit => "explicit",
        }
    }

    /// Strategies other than `explicit` need a configured default org/repo.
    pub fn needs_defaults(&self) -> bool {
        !matches!(self, PathStrategy::Explicit)
    }
}

impl fmt::Display for PathStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PathStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "legacy" => Ok(PathStrategy::Legacy),
            "single" => Ok(PathStrategy::Single),
            "explicit" => Ok(PathStrategy::Explicit),
            _ => Err(format!(
                "Invalid path strategy: '{}'. Expected: legacy, single, or explicit",
                s
            )),
        }
    }
}

/// Artifact-store destination configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GcsConfiguration {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_strategy: Option<PathStrategy>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_org: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_repo: String,
    /// Extension -> media type overrides for uploaded blobs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub media_types: BTreeMap<String, String>,
}

impl GcsConfiguration {
    pub fn apply_default(&self, def: &GcsConfiguration) -> GcsConfiguration {
        GcsConfiguration {
            bucket: non_empty_or(&self.bucket, &def.bucket),
            path_prefix: non_empty_or(&self.path_prefix, &def.path_prefix),
            path_strategy: self.path_strategy.or(def.path_strategy),
            default_org: non_empty_or(&self.default_org, &def.default_org),
            default_repo: non_empty_or(&self.default_repo, &def.default_repo),
            media_types: if self.media_types.is_empty() {
                def.media_types.clone()
            } else {
                self.media_types.clone()
            },
        }
    }

    pub fn validate(&self) -> Result<(), DecorationError> {
        StoragePath::parse(&self.bucket).map_err(|source| DecorationError::InvalidBucket {
            bucket: self.bucket.clone(),
            source,
        })?;
        for (extension, media_type) in &self.media_types {
            if !valid_media_type(media_type) {
                return Err(DecorationError::InvalidMediaType {
                    extension: extension.clone(),
                    media_type: media_type.clone(),
                });
            }
        }
        let strategy = self
            .path_strategy
            .ok_or(DecorationError::MissingPathStrategy)?;
        if strategy.needs_defaults() && (self.default_org.is_empty() || self.default_repo.is_empty())
        {
            return Err(DecorationError::MissingDefaultOrgRepo(strategy));
        }
        Ok(())
    }
}

fn merge_nested<T: Clone>(
    primary: &Option<T>,
    def: &Option<T>,
    merge: impl Fn(&T, &T) -> T,
) -> Option<T> {
    match (primary, def) {
        (Some(primary), Some(def)) => Some(merge(primary, def)),
        (Some(primary), None) => Some(primary.clone()),
        (None, def) => def.clone(),
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

/// `type/subtype`, optionally followed by `;`-separated parameters.
fn valid_media_type(raw: &str) -> bool {
    let essence = raw.split(';').next().unwrap_or("").trim();
    let mut halves = essence.splitn(2, '/');
    match (halves.next(), halves.next()) {
        (Some(kind), Some(subtype)) => is_media_token(kind) && is_media_token(subtype),
        _ => false,
    }
}

fn is_media_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "!#$&^_.+-".contains(ch))
}

/// Per-job knobs for the execution backend: timeouts, artifact
/// destination, credentials references, clone policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DecorationConfig {
    /// Hard cap on payload runtime.
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Grace window between SIGTERM and SIGKILL.
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub grace_period: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utility_images: Option<UtilityImages>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs_configuration: Option<GcsConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs_credentials_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_key_secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookiefile_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_cloning: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_host_fingerprints: Vec<String>,
}

impl DecorationConfig {
    /// Field-by-field merge: use self if set, else use `def`. Nested
    /// sub-structures recurse with the same semantics.
    pub fn apply_default(&self, def: &DecorationConfig) -> DecorationConfig {
        DecorationConfig {
            timeout: self.timeout.or(def.timeout),
            grace_period: self.grace_period.or(def.grace_period),
            utility_images: merge_nested(&self.utility_images, &def.utility_images, |a, b| {
                a.apply_default(b)
            }),
            resources: merge_nested(&self.resources, &def.resources, |a, b| a.apply_default(b)),
            gcs_configuration: merge_nested(
                &self.gcs_configuration,
                &def.gcs_configuration,
                |a, b| a.apply_default(b),
            ),
            gcs_credentials_secret: self
                .gcs_credentials_secret
                .clone()
                .or_else(|| def.gcs_credentials_secret.clone()),
            ssh_key_secrets: if self.ssh_key_secrets.is_empty() {
                def.ssh_key_secrets.clone()
            } else {
                self.ssh_key_secrets.clone()
            },
            oauth_token_secret: self
                .oauth_token_secret
                .clone()
                .or_else(|| def.oauth_token_secret.clone()),
            cookiefile_secret: self
                .cookiefile_secret
                .clone()
                .or_else(|| def.cookiefile_secret.clone()),
            skip_cloning: self.skip_cloning.or(def.skip_cloning),
            clone_depth: self.clone_depth.or(def.clone_depth),
            ssh_host_fingerprints: if self.ssh_host_fingerprints.is_empty() {
                def.ssh_host_fingerprints.clone()
            } else {
                self.ssh_host_fingerprints.clone()
            },
        }
    }

    pub fn validate(&self) -> Result<(), DecorationError> {
        let images = self
            .utility_images
            .clone()
            .unwrap_or_default();
        let missing = images.missing();
        if !missing.is_empty() {
            return Err(DecorationError::MissingUtilityImages(missing.join(", ")));
        }
        let gcs = self
            .gcs_configuration
            .as_ref()
            .ok_or(DecorationError::MissingGcsConfiguration)?;
        gcs.validate()?;
        if self.oauth_token_secret.is_some() && !self.ssh_key_secrets.is_empty() {
            return Err(DecorationError::ConflictingCloneCredentials);
        }
        Ok(())
    }
}

/// Merge a primary decoration config against a default. A missing primary
/// defaults to the default wholesale.
pub fn apply_default(
    primary: Option<&DecorationConfig>,
    def: Option<&DecorationConfig>,
) -> Option<DecorationConfig> {
    match (primary, def) {
        (Some(primary), Some(def)) => Some(primary.apply_default(def)),
        (Some(primary), None) => Some(primary.clone()),
        (None, def) => def.cloned(),
    }
}

#[derive(Debug, Error)]
pub enum DecorationError {
    #[error("utility images not specified: {0}")]
    MissingUtilityImages(String),
    #[error("artifact-store configuration is required")]
    MissingGcsConfiguration,
    #[error("invalid artifact bucket {bucket:?}: {source}")]
    InvalidBucket {
        bucket: String,
        #[source]
        source: PathError,
    },
    #[error("invalid media type {media_type:?} for extension {extension:?}")]
    InvalidMediaType {
        extension: String,
        media_type: String,
    },
    #[error("path strategy must be one of legacy, single, explicit")]
    MissingPathStrategy,
    #[error("path strategy {0} requires a default org and repo")]
    MissingDefaultOrgRepo(PathStrategy),
    #[error("oauth token secret and ssh key secrets are mutually exclusive")]
    ConflictingCloneCredentials,
}
