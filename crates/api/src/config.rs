//! Client configuration: base URL and credential discovery.

use std::env;

use tracing::debug;
use url::Url;

use crate::ApiError;

/// Default public endpoint of the confidential VM API.
pub const DEFAULT_API_BASE: &str = "https://cloud-api.phala.network/api/v1";
/// Environment variable overriding [`DEFAULT_API_BASE`].
pub const API_BASE_ENV: &str = "CVMSTEP_API_BASE";
/// Environment variables holding the API key, checked in order.
pub const API_KEY_ENV_VARS: &[&str] = &["PHALA_API_KEY", "CVMSTEP_API_KEY"];

const KEYRING_SERVICE: &str = "cvmstep";
const KEYRING_USER: &str = "api-key";

/// Hostnames or base domains allowed for non-local API bases. Subdomains are
/// allowed too.
const ALLOWED_API_DOMAINS: &[&str] = &["phala.network", "phala.com"];
/// Hostnames allowed for local development regardless of scheme.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

/// Resolved connection settings for [`crate::CvmApiClient`].
#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: Url,
    pub api_key: String,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl ApiConfig {
    /// Build a config from explicit values, validating the base URL.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            base_url: validate_base_url(base_url)?,
            api_key: api_key.into(),
        })
    }

    /// Resolve settings from the process environment and the OS keyring.
    ///
    /// Resolution order for the key:
    /// - `PHALA_API_KEY`
    /// - `CVMSTEP_API_KEY`
    /// - keyring entry `cvmstep` / `api-key`
    pub fn from_env() -> Result<Self, ApiError> {
        let base = env::var(API_BASE_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let api_key = api_key_from_env().or_else(api_key_from_keyring).ok_or(ApiError::MissingApiKey)?;
        Self::new(&base, api_key)
    }
}

fn api_key_from_env() -> Option<String> {
    API_KEY_ENV_VARS.iter().find_map(|name| {
        env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn api_key_from_keyring() -> Option<String> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER).ok()?;
    match entry.get_password() {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Ok(_) => None,
        Err(error) => {
            debug!(%error, "no API key in keyring");
            None
        }
    }
}

/// Validate that a base URL is acceptable for use by the client.
///
/// Rules:
/// - `localhost` or `127.0.0.1`: any scheme is allowed
/// - otherwise: scheme must be HTTPS, and host must be one of the allowed
///   domains or a subdomain thereof
pub fn validate_base_url(base: &str) -> Result<Url, ApiError> {
    let parsed = Url::parse(base.trim_end_matches('/')).map_err(|error| ApiError::invalid_base(base, error.to_string()))?;

    let host_name = parsed
        .host_str()
        .ok_or_else(|| ApiError::invalid_base(base, "must include a host"))?;

    if LOCALHOST_DOMAINS
        .iter()
        .any(|&allowed| host_name.eq_ignore_ascii_case(allowed))
    {
        return Ok(parsed);
    }

    if parsed.scheme() != "https" {
        return Err(ApiError::invalid_base(
            base,
            format!("must use https for non-localhost hosts; got '{}://'", parsed.scheme()),
        ));
    }

    let is_allowed_domain = ALLOWED_API_DOMAINS.iter().any(|&allowed_domain| {
        host_name.eq_ignore_ascii_case(allowed_domain) || host_name.ends_with(&format!(".{allowed_domain}"))
    });
    if !is_allowed_domain {
        return Err(ApiError::invalid_base(
            base,
            format!("host '{host_name}' is not one of {ALLOWED_API_DOMAINS:?} or a subdomain, or localhost"),
        ));
    }

    Ok(parsed)
}
