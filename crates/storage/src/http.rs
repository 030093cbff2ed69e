//! Object store speaking plain HTTP verbs against a base URL.
//!
//! Works with any endpoint that maps `PUT`, `GET` and `HEAD` on
//! `<base>/<key>` to object writes, reads and existence checks, which covers
//! public or policy-scoped S3 buckets and simple artifact servers.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::{Client, StatusCode, header};
use tracing::debug;
use url::Url;

use crate::{ObjectStore, StorageError, keys::validate_key};

/// Characters escaped inside a single key segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/');

#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    base: Url,
    http: Client,
}

impl HttpObjectStore {
    /// Build a store against `base`, which must end with `/`.
    pub fn new(base: Url) -> Result<Self, StorageError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|error| StorageError::transport(base.as_str(), error))?;
        Ok(Self::with_client(base, http))
    }

    pub fn with_client(base: Url, http: Client) -> Self {
        Self { base, http }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url_for(&self, key: &str) -> Result<Url, StorageError> {
        validate_key(key)?;
        let encoded = key
            .split('/')
            .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        self.base.join(&encoded).map_err(|_| StorageError::InvalidKey(key.to_string()))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let url = self.url_for(key)?;
        debug!(%url, size = bytes.len(), "uploading object");
        let response = self
            .http
            .put(url)
            .body(bytes)
            .send()
            .await
            .map_err(|error| StorageError::transport(key, error))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<bool, StorageError> {
        let url = self.url_for(key)?;
        debug!(%url, size = bytes.len(), "uploading object unless present");
        let response = self
            .http
            .put(url)
            .header(header::IF_NONE_MATCH, "*")
            .body(bytes)
            .send()
            .await
            .map_err(|error| StorageError::transport(key, error))?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(StorageError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let url = self.url_for(key)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|error| StorageError::transport(key, error))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.bytes().await.map_err(|error| StorageError::transport(key, error))?;
                Ok(Some(body.to_vec()))
            }
            status => Err(StorageError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let url = self.url_for(key)?;
        let response = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|error| StorageError::transport(key, error))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(StorageError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    fn object_url(&self, key: &str) -> String {
        self.url_for(key)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| format!("{}{}", self.base, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_bytes, header as header_eq, method, path},
    };

    async fn store_for(server: &MockServer) -> HttpObjectStore {
        let base = Url::parse(&format!("{}/bucket/", server.uri())).unwrap();
        HttpObjectStore::new(base).unwrap()
    }

    #[tokio::test]
    async fn put_sends_body_to_key_path() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/runs/r1/package.tar.gz"))
            .and(body_bytes(b"hello".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        store.put("runs/r1/package.tar.gz", b"hello".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn conditional_put_reports_existing_object() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/runs/r1/package.tar.gz"))
            .and(header_eq("If-None-Match", "*"))
            .respond_with(ResponseTemplate::new(412))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert!(!store.put_if_absent("runs/r1/package.tar.gz", b"hello".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn conditional_put_writes_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(header_eq("If-None-Match", "*"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert!(store.put_if_absent("runs/r1/package.tar.gz", b"hello".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn missing_objects_map_to_none_and_false() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert_eq!(store.get("runs/r1/sentinels/s/1/0.json").await.unwrap(), None);
        assert!(!store.exists("runs/r1/package.tar.gz").await.unwrap());
    }

    #[tokio::test]
    async fn get_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/runs/r1/sentinels/s/1/0.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"exit_code\":0}"))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let body = store.get("runs/r1/sentinels/s/1/0.json").await.unwrap().unwrap();
        assert_eq!(body, b"{\"exit_code\":0}".to_vec());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let error = store.put("runs/r1/package.tar.gz", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(error, StorageError::Status { status: 502, .. }));
        assert!(error.is_transient());
    }

    #[test]
    fn object_url_escapes_segments() {
        let store = HttpObjectStore::new(Url::parse("https://store.example.com/b/").unwrap()).unwrap();
        assert_eq!(
            store.object_url("runs/r 1/package.tar.gz"),
            "https://store.example.com/b/runs/r%201/package.tar.gz"
        );
    }
}
