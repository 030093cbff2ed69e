//! Object key layout shared by the dispatcher and the remote bootstrap script.
//!
//! ```text
//! runs/<run_id>/package.tar.gz
//! runs/<run_id>/sentinels/<step>/<task_id>/<attempt>.json
//! ```

use crate::StorageError;

const RUNS_PREFIX: &str = "runs";
const PACKAGE_OBJECT: &str = "package.tar.gz";
const SENTINEL_DIR: &str = "sentinels";

/// Key of the code package staged once per run.
pub fn package_key(run_id: &str) -> Result<String, StorageError> {
    let run_segment = single_segment(run_id)?;
    let key = format!("{RUNS_PREFIX}/{run_segment}/{PACKAGE_OBJECT}");
    validate_key(&key)?;
    Ok(key)
}

/// Key of the completion sentinel for one step invocation.
///
/// `invocation_id` is `<step>/<task_id>/<attempt>` and may contain slashes.
pub fn sentinel_key(run_id: &str, invocation_id: &str) -> Result<String, StorageError> {
    let run_segment = single_segment(run_id)?;
    let key = format!("{RUNS_PREFIX}/{run_segment}/{SENTINEL_DIR}/{}.json", invocation_id.trim_matches('/'));
    validate_key(&key)?;
    Ok(key)
}

/// Reject keys that could escape the store root or address nothing.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn single_segment(value: &str) -> Result<&str, StorageError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.contains('/') {
        return Err(StorageError::InvalidKey(value.to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_key_is_run_scoped() {
        assert_eq!(package_key("r1").unwrap(), "runs/r1/package.tar.gz");
        assert!(package_key("").is_err());
        assert!(package_key("a/b").is_err());
    }

    #[test]
    fn sentinel_key_nests_invocation_id() {
        assert_eq!(
            sentinel_key("r1", "train/7/0").unwrap(),
            "runs/r1/sentinels/train/7/0.json"
        );
        assert_ne!(sentinel_key("r1", "train/7/0").unwrap(), sentinel_key("r1", "train/7/1").unwrap());
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(sentinel_key("r1", "../../etc/0").is_err());
        assert!(validate_key("runs//x").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("runs/r1/ok.json").is_ok());
    }
}
