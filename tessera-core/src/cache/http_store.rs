//! Key-value store over plain HTTP `GET`/`PUT`.

use super::kv::KvStore;
use super::CacheError;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;

/// Keys are base64url-encoded into the last path segment:
/// `<address>/<base64url(key)>`. A 404 reads as an empty value.
#[derive(Debug, Clone)]
pub struct HttpKvStore {
    address: String,
    headers: BTreeMap<String, String>,
    client: Client,
}

impl HttpKvStore {
    pub fn new(address: &str, headers: BTreeMap<String, String>) -> Result<Self, CacheError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CacheError::backend(address, e))?;
        Ok(Self { address: address.trim_end_matches('/').to_string(), headers, client })
    }

    /// Parses `Name: value` header specs as given on the command line.
    pub fn parse_headers(specs: &[String]) -> Result<BTreeMap<String, String>, CacheError> {
        let mut headers = BTreeMap::new();
        for spec in specs {
            let (name, value) = spec.split_once(':').ok_or_else(|| {
                CacheError::backend(spec, "malformed http header, format is <header>:<value>")
            })?;
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
        Ok(headers)
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.address, URL_SAFE.encode(key))
    }

    fn with_headers(&self, mut req: RequestBuilder) -> RequestBuilder {
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        req
    }
}

#[async_trait::async_trait]
impl KvStore for HttpKvStore {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        let resp = self
            .with_headers(self.client.get(self.url(key)))
            .send()
            .await
            .map_err(|e| CacheError::backend(key, e))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(String::new()),
            StatusCode::OK => resp.text().await.map_err(|e| CacheError::backend(key, e)),
            status => Err(CacheError::backend(key, format!("bad status code from cache server: {}", status))),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let resp = self
            .with_headers(self.client.put(self.url(key)).body(value.to_string()))
            .send()
            .await
            .map_err(|e| CacheError::backend(key, e))?;
        if !resp.status().is_success() {
            return Err(CacheError::backend(
                key,
                format!("bad status code from cache server: {}", resp.status()),
            ));
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_encodes_key() {
        let store = HttpKvStore::new("http://cache.local/kv/", BTreeMap::new()).unwrap();
        assert_eq!(store.url("a/b"), format!("http://cache.local/kv/{}", URL_SAFE.encode("a/b")));
    }

    #[test]
    fn test_parse_headers() {
        let headers = HttpKvStore::parse_headers(&["Authorization: Bearer x".to_string()]).unwrap();
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer x"));
        assert!(HttpKvStore::parse_headers(&["no-colon".to_string()]).is_err());
    }
}
