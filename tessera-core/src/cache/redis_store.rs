//! Key-value store backed by a Redis server.

use super::kv::KvStore;
use super::CacheError;
use redis::aio::MultiplexedConnection;
use redis::{Client, FromRedisValue, Value};
use std::time::Duration;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Entries are written with `SET ... EX <ttl>`; a nil `GET` reads as an
/// empty value.
#[derive(Debug, Clone)]
pub struct RedisKvStore {
    address: String,
    client: Client,
    ttl_secs: u64,
}

impl RedisKvStore {
    /// `address` is either `host:port` or a `redis://` URL.
    pub fn new(address: &str, ttl_secs: u64) -> Result<Self, CacheError> {
        let client = Client::open(connection_url(address)).map_err(|e| CacheError::backend(address, e))?;
        Ok(Self { address: address.to_string(), client, ttl_secs })
    }

    async fn connect(&self, key: &str) -> Result<MultiplexedConnection, CacheError> {
        match timeout(CONNECT_TIMEOUT, self.client.get_multiplexed_async_connection()).await {
            Ok(conn) => conn.map_err(|e| CacheError::backend(key, e)),
            Err(_) => Err(CacheError::backend(key, format!("timed out connecting to redis at {}", self.address))),
        }
    }
}

fn connection_url(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{}", address)
    }
}

/// Nil replies are missing keys.
fn decode_value(key: &str, reply: &Value) -> Result<String, CacheError> {
    let value = Option::<String>::from_redis_value(reply).map_err(|e| CacheError::backend(key, e))?;
    Ok(value.unwrap_or_default())
}

#[async_trait::async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        let mut conn = self.connect(key).await?;
        let reply: Value = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(key, e))?;
        decode_value(key, &reply)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.connect(key).await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(key, e))?;
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
    fn test_nil_reply_is_empty() {
        assert_eq!(decode_value("k", &Value::Nil).unwrap(), "");
        assert_eq!(decode_value("k", &Value::Data(b"tar,gzip".to_vec())).unwrap(), "tar,gzip");
        assert!(decode_value("k", &Value::Bulk(vec![Value::Nil, Value::Nil])).is_err());
    }

    #[test]
    fn test_bare_address_gets_scheme() {
        assert_eq!(connection_url("cache.local:6379"), "redis://cache.local:6379");
        assert_eq!(connection_url("rediss://cache.local:6380/2"), "rediss://cache.local:6380/2");
        assert!(RedisKvStore::new("cache.local:6379", 60).is_ok());
    }
}
