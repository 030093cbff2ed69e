use std::{env, time::Duration};

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use cvmstep_types::{BootstrapPayload, InstanceHandle, InstanceSpec, InstanceStatus};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{ApiConfig, ApiError, InstanceProvisioner};

const API_KEY_HEADER: &str = "X-API-Key";

/// Body of `POST /instances`.
#[derive(Debug, Serialize)]
struct CreateInstanceRequest<'a> {
    name: &'a str,
    image: &'a str,
    vcpu: u32,
    memory: u32,
    disk_size: u32,
    compose_file: &'a str,
}

/// Thin wrapper around a configured `reqwest::Client` for the confidential VM API.
///
/// Every request carries the `X-API-Key` header and a consistent User-Agent.
/// No call is retried here; the dispatcher owns retry policy.
#[derive(Debug, Clone)]
pub struct CvmApiClient {
    base_url: String,
    http: Client,
    user_agent: String,
}

impl CvmApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let mut default_headers = header::HeaderMap::new();
        let mut api_key = header::HeaderValue::from_str(&config.api_key)
            .map_err(|_| ApiError::InvalidApiKey)?;
        api_key.set_sensitive(true);
        default_headers.insert(API_KEY_HEADER, api_key);
        default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| ApiError::Transport {
                operation: "client setup",
                source,
            })?;

        Ok(Self {
            base_url: config.base_url.as_str().trim_end_matches('/').to_string(),
            http,
            user_agent: format!("cvmstep/{}; {}", env!("CARGO_PKG_VERSION"), env::consts::OS),
        })
    }

    /// Construct a client from `CVMSTEP_API_BASE` and the discovered API key.
    pub fn from_env() -> Result<Self, ApiError> {
        Self::new(&ApiConfig::from_env()?)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "building request");
        self.http.request(method, url).header(header::USER_AGENT, &self.user_agent)
    }

    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Response, ApiError> {
        request
            .send()
            .await
            .map_err(|source| ApiError::Transport { operation, source })
    }

    async fn json_body(operation: &'static str, response: Response) -> Result<Value, ApiError> {
        let text = response
            .text()
            .await
            .map_err(|source| ApiError::Transport { operation, source })?;
        serde_json::from_str(&text).map_err(|error| ApiError::malformed(operation, error.to_string()))
    }
}

/// Turn a non-success response into an [`ApiError`], keeping the body as detail.
async fn error_for(operation: &'static str, response: Response) -> ApiError {
    let status = response.status().as_u16();
    let detail = match response.text().await {
        Ok(body) => error_detail(&body),
        Err(error) => error.to_string(),
    };
    ApiError::from_status(operation, status, detail)
}

/// Prefer a `detail` or `message` field from a JSON error body.
fn error_detail(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for field in ["detail", "message", "error"] {
            match value.get(field) {
                Some(Value::String(text)) => return text.clone(),
                Some(other) if !other.is_null() => return other.to_string(),
                _ => {}
            }
        }
    }
    body.trim().to_string()
}

/// Characters escaped in an instance id path segment.
const ID_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Instance id as exactly one path segment. Ids made only of dots would be
/// resolved as `.`/`..` even when escaped, so they are refused.
fn id_segment(operation: &'static str, handle: &InstanceHandle) -> Result<String, ApiError> {
    let id = handle.id();
    if id.is_empty() || id.chars().all(|character| character == '.') {
        return Err(ApiError::malformed(operation, format!("invalid instance id '{id}'")));
    }
    Ok(utf8_percent_encode(id, ID_SEGMENT).to_string())
}

/// Extract the instance id, accepting either a string or a number.
fn instance_id(body: &Value) -> Option<String> {
    match body.get("id")? {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[async_trait]
impl InstanceProvisioner for CvmApiClient {
    async fn create(&self, spec: &InstanceSpec, payload: &BootstrapPayload) -> Result<InstanceHandle, ApiError> {
        const OPERATION: &str = "create";
        let body = CreateInstanceRequest {
            name: &payload.instance_name,
            image: &spec.image,
            vcpu: spec.cpu,
            memory: spec.memory_mb,
            disk_size: spec.disk_gb,
            compose_file: &payload.compose_file,
        };
        let response = self.send(OPERATION, self.request(Method::POST, "/instances").json(&body)).await?;
        if !response.status().is_success() {
            return Err(error_for(OPERATION, response).await);
        }

        let value = Self::json_body(OPERATION, response).await?;
        let id = instance_id(&value).ok_or_else(|| ApiError::malformed(OPERATION, "response has no instance id"))?;
        info!(instance_id = %id, instance_name = %payload.instance_name, "instance created");
        Ok(InstanceHandle::new(id))
    }

    async fn start(&self, handle: &InstanceHandle) -> Result<(), ApiError> {
        const OPERATION: &str = "start";
        let path = format!("/instances/{}/start", id_segment(OPERATION, handle)?);
        let response = self.send(OPERATION, self.request(Method::POST, &path)).await?;
        if !response.status().is_success() {
            return Err(error_for(OPERATION, response).await);
        }
        info!(instance_id = %handle, "instance started");
        Ok(())
    }

    async fn destroy(&self, handle: &InstanceHandle) -> Result<(), ApiError> {
        const OPERATION: &str = "destroy";
        let path = format!("/instances/{}", id_segment(OPERATION, handle)?);
        let response = self.send(OPERATION, self.request(Method::DELETE, &path)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                info!(instance_id = %handle, "instance already gone; treating destroy as done");
                Ok(())
            }
            status if status.is_success() => {
                info!(instance_id = %handle, "instance destroyed");
                Ok(())
            }
            _ => Err(error_for(OPERATION, response).await),
        }
    }

    async fn status(&self, handle: &InstanceHandle) -> Result<InstanceStatus, ApiError> {
        const OPERATION: &str = "status";
        let path = format!("/instances/{}", id_segment(OPERATION, handle)?);
        let response = self.send(OPERATION, self.request(Method::GET, &path)).await?;
        if !response.status().is_success() {
            return Err(error_for(OPERATION, response).await);
        }
        let value = Self::json_body(OPERATION, response).await?;
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::malformed(OPERATION, "response has no status field"))?;
        Ok(InstanceStatus {
            status: status.to_string(),
        })
    }
}
