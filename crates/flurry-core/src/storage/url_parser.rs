//! URL parsing for storage backends.
//!
//! Recognised forms:
//! - `s3://bucket/key`, path-style and virtual-hosted AWS URLs
//! - `s3::http://host:port/bucket/key` for S3-compatible endpoints such as MinIO
//! - `gs://bucket/key` and the `storage.googleapis.com` URLs
//! - `file:///path`, `file:/path` and absolute paths

use object_store::path::Path;
use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{GcsConfig, LocalConfig, S3Config};

const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?P<protocol>https?)://(?P<endpoint>[^:/]+)(:(?P<port>\d+))?/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const GCS_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+))?$";
const GCS_PATH: &str =
    r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$";
const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^(?P<path>/.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Local,
}

/// Patterns in match priority order.
static MATCHERS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    [
        (Backend::S3, S3_PATH),
        (Backend::S3, S3_VIRTUAL),
        (Backend::S3, S3_ENDPOINT_URL),
        (Backend::S3, S3_URL),
        (Backend::Gcs, GCS_PATH),
        (Backend::Gcs, GCS_VIRTUAL),
        (Backend::Gcs, GCS_URL),
        (Backend::Local, FILE_URI),
        (Backend::Local, FILE_URL),
        (Backend::Local, FILE_PATH),
    ]
    .into_iter()
    .map(|(backend, pattern)| (backend, Regex::new(pattern).expect("storage URL pattern is valid")))
    .collect()
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    ///
    /// Nothing is read from the process environment; credentials and
    /// regions are supplied separately as storage options.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        let url = url.trim_end_matches('/');
        let matched = MATCHERS
            .iter()
            .find_map(|(backend, regex)| regex.captures(url).map(|caps| (*backend, caps)));

        match matched {
            Some((Backend::S3, caps)) => Ok(Self::parse_s3(&caps)),
            Some((Backend::Gcs, caps)) => Ok(Self::parse_gcs(&caps)),
            Some((Backend::Local, caps)) => Ok(Self::parse_local(&caps)),
            None => InvalidUrlSnafu { url }.fail(),
        }
    }

    fn parse_s3(caps: &Captures) -> Self {
        let endpoint = caps.name("endpoint").map(|host| {
            let protocol = caps.name("protocol").map_or("https", |p| p.as_str());
            match caps.name("port") {
                Some(port) => format!("{protocol}://{}:{}", host.as_str(), port.as_str()),
                None => format!("{protocol}://{}", host.as_str()),
            }
        });

        BackendConfig::S3(S3Config {
            endpoint,
            region: caps.name("region").map(|m| m.as_str().to_string()),
            bucket: caps["bucket"].to_string(),
            key: key_of(caps),
        })
    }

    fn parse_gcs(caps: &Captures) -> Self {
        BackendConfig::Gcs(GcsConfig {
            bucket: caps["bucket"].to_string(),
            key: key_of(caps),
        })
    }

    fn parse_local(caps: &Captures) -> Self {
        let path = &caps["path"];
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        BackendConfig::Local(LocalConfig { path })
    }

    /// Key prefix inside the bucket, if any.
    pub fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

fn key_of(caps: &Captures) -> Option<Path> {
    caps.name("key").map(|m| Path::from(m.as_str()))
}
