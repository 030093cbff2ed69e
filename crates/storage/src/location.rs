//! Parsing of the datastore sysroot into a concrete backend location.

use std::path::PathBuf;

use url::Url;

use crate::StorageError;

/// Environment variable naming the datastore sysroot.
pub const SYSROOT_ENV: &str = "CVMSTEP_DATASTORE_SYSROOT";

/// Where step artifacts and sentinels live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// A directory on the local filesystem (`file://` or a bare path).
    Local { root: PathBuf },
    /// A plain HTTP(S) object endpoint supporting PUT, GET and HEAD.
    Http { base: Url },
    /// An S3 bucket and key prefix (`s3://bucket/prefix`).
    S3 { bucket: String, prefix: String },
}

impl StorageLocation {
    /// Parse a sysroot string.
    ///
    /// Trailing slashes on the S3 prefix are trimmed, so `s3://b/p/` yields
    /// bucket `b` and prefix `p`.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StorageError::invalid_location(raw, "sysroot is empty"));
        }

        if let Some(rest) = trimmed.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(StorageError::invalid_location(raw, "missing bucket name"));
            }
            return Ok(Self::S3 {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
            });
        }

        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let base = Url::parse(trimmed).map_err(|error| StorageError::invalid_location(raw, error.to_string()))?;
            if base.host_str().is_none() {
                return Err(StorageError::invalid_location(raw, "missing host"));
            }
            return Ok(Self::Http {
                base: with_trailing_slash(base),
            });
        }

        if trimmed.starts_with("file://") {
            let url = Url::parse(trimmed).map_err(|error| StorageError::invalid_location(raw, error.to_string()))?;
            let root = url
                .to_file_path()
                .map_err(|_| StorageError::invalid_location(raw, "file URL must be an absolute path"))?;
            return Ok(Self::Local { root });
        }

        if trimmed.contains("://") {
            return Err(StorageError::invalid_location(raw, "unsupported scheme"));
        }
        Ok(Self::Local {
            root: PathBuf::from(trimmed),
        })
    }

    /// HTTP endpoint for remote backends; `None` for local directories.
    ///
    /// S3 locations map to the virtual-hosted bucket endpoint. Requests are
    /// unsigned, so the bucket must allow the instance's access policy.
    pub fn http_base(&self) -> Option<Url> {
        match self {
            Self::Local { .. } => None,
            Self::Http { base } => Some(base.clone()),
            Self::S3 { bucket, prefix } => {
                let mut raw = format!("https://{bucket}.s3.amazonaws.com/");
                if !prefix.is_empty() {
                    raw.push_str(prefix);
                    raw.push('/');
                }
                Url::parse(&raw).ok()
            }
        }
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s3_sysroot_and_trims_slash() {
        let location = StorageLocation::parse("s3://b/p/").unwrap();
        assert_eq!(
            location,
            StorageLocation::S3 {
                bucket: "b".into(),
                prefix: "p".into()
            }
        );
    }

    #[test]
    fn parses_bucket_without_prefix() {
        let location = StorageLocation::parse("s3://bucket").unwrap();
        assert_eq!(
            location.http_base().unwrap().as_str(),
            "https://bucket.s3.amazonaws.com/"
        );
    }

    #[test]
    fn s3_prefix_becomes_endpoint_path() {
        let location = StorageLocation::parse("s3://data/metaflow/runs/").unwrap();
        assert_eq!(
            location.http_base().unwrap().as_str(),
            "https://data.s3.amazonaws.com/metaflow/runs/"
        );
    }

    #[test]
    fn http_base_gets_trailing_slash() {
        let location = StorageLocation::parse("https://store.example.com/bucket").unwrap();
        assert_eq!(location.http_base().unwrap().as_str(), "https://store.example.com/bucket/");
    }

    #[test]
    fn bare_paths_and_file_urls_are_local() {
        assert_eq!(
            StorageLocation::parse("/tmp/datastore").unwrap(),
            StorageLocation::Local {
                root: PathBuf::from("/tmp/datastore")
            }
        );
        assert!(matches!(
            StorageLocation::parse("file:///var/data").unwrap(),
            StorageLocation::Local { .. }
        ));
    }

    #[test]
    fn rejects_unknown_schemes_and_empty_buckets() {
        assert!(StorageLocation::parse("gs://bucket").is_err());
        assert!(StorageLocation::parse("s3:///prefix").is_err());
        assert!(StorageLocation::parse("  ").is_err());
    }
}
