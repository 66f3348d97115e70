//! Typed storage paths for artifact destinations.
//!
//! A [`StoragePath`] is a URL-like value with a storage-scheme prefix
//! (`gs`, `s3`, ...) and a bucket. Construction accepts either an explicit
//! `scheme://bucket[/path]` string or a bare bucket name, which defaults
//! to the `gs` scheme.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

/// Scheme assumed for bare bucket names.
pub const DEFAULT_SCHEME: &str = "gs";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("storage path must not be empty")]
    Empty,
    #[error("storage path {0:?} has no bucket")]
    MissingBucket(String),
    #[error("malformed storage path {input:?}: {source}")]
    Malformed {
        input: String,
        #[source]
        source: url::ParseError,
    },
}

/// `scheme://bucket[/path]`. The path, when present, keeps its leading
/// slash so that `full_path` is exactly `bucket + path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoragePath {
    scheme: String,
    bucket: String,
    path: String,
}

impl StoragePath {
    /// Parse a bucket expression. Bare names become `gs://` buckets; a
    /// leading segment is only treated as a scheme when the input is an
    /// absolute URL (so `my-bucket/a://weird.file` stays a `gs` path).
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        match Url::parse(raw) {
            Ok(url) if url.has_host() => {
                let bucket = url
                    .host_str()
                    .map(str::to_string)
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| PathError::MissingBucket(raw.to_string()))?;
                Ok(Self {
                    scheme: url.scheme().to_string(),
                    bucket,
                    path: url.path().trim_end_matches('/').to_string(),
                })
            }
            // Absolute but host-less (e.g. "data:foo") or relative input:
            // interpret the whole string as a gs bucket plus path.
            Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => Self::parse_bare(raw),
            Err(source) => Err(PathError::Malformed {
                input: raw.to_string(),
                source,
            }),
        }
    }

    fn parse_bare(raw: &str) -> Result<Self, PathError> {
        let (bucket, path) = match raw.find('/') {
            Some(index) => (&raw[..index], raw[index..].to_string()),
            None => (raw, String::new()),
        };
        if bucket.is_empty() {
            return Err(PathError::MissingBucket(raw.to_string()));
        }
        Ok(Self {
            scheme: DEFAULT_SCHEME.to_string(),
            bucket: bucket.to_string(),
            path: path.trim_end_matches('/').to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `bucket + path`, the provider-relative object prefix.
    pub fn full_path(&self) -> String {
        format!("{}{}", self.bucket, self.path)
    }

    /// Append one path segment.
    pub fn join(&self, segment: &str) -> StoragePath {
        let segment = segment.trim_matches('/');
        if segment.is_empty() {
            return self.clone();
        }
        StoragePath {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            path: format!("{}/{}", self.path, segment),
        }
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.bucket, self.path)
    }
}

impl FromStr for StoragePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StoragePath::parse(s)
    }
}
