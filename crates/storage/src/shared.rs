use crate::StorageError;
use rand::{RngCore, rngs::OsRng};
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;

const LOCK_RETRY_ATTEMPTS: u32 = 20;
const LOCK_RETRY_DELAY_MS: u64 = 100;
const UNLOCK_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

fn lock_token() -> String {
    let mut seed = [0u8; 16];
    OsRng.fill_bytes(&mut seed);
    let mut token = String::with_capacity(seed.len() * 2);
    for byte in seed {
        token.push_str(&format!("{byte:02x}"));
    }
    token
}

/// Typed facade over the in-memory shared store. Every redis interaction in
/// the system goes through this adapter.
#[derive(Clone)]
pub struct SharedStore {
    client: redis::Client,
    conn: Arc<Mutex<MultiplexedConnection>>,
}

/// Establishes connectivity to the Redis backend.
pub async fn connect(redis_url: &str) -> Result<SharedStore, StorageError> {
    let client = redis::Client::open(redis_url).map_err(|_| StorageError::Redis)?;
    let conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| StorageError::Redis)?;
    Ok(SharedStore {
        client,
        conn: Arc::new(Mutex::new(conn)),
    })
}

impl SharedStore {
    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        let _: String = redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Attempts an atomic set-if-absent lock acquisition. Returns the release
    /// token on success, None when another holder owns the key.
    pub async fn try_lock(
        &self,
        key: &str,
        ttl_seconds: i64,
    ) -> Result<Option<String>, StorageError> {
        let token = lock_token();
        let mut conn = self.conn.lock().await;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(acquired.map(|_| token))
    }

    /// Releases a lock only when `token` still matches the stored value, so
    /// one holder cannot release another's lock after its own TTL lapsed.
    pub async fn unlock(&self, key: &str, token: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock().await;
        let released: i64 = redis::cmd("EVAL")
            .arg(UNLOCK_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(token)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(released == 1)
    }

    /// Runs `operation` while holding the named lock, retrying acquisition
    /// briefly. Returns Ok(None) when the lock stays unavailable.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        ttl_seconds: i64,
        operation: F,
    ) -> Result<Option<T>, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut token = None;
        for attempt in 0..LOCK_RETRY_ATTEMPTS {
            if let Some(acquired) = self.try_lock(key, ttl_seconds).await? {
                token = Some(acquired);
                break;
            }
            if attempt + 1 < LOCK_RETRY_ATTEMPTS {
                tokio::time::sleep(StdDuration::from_millis(LOCK_RETRY_DELAY_MS)).await;
            }
        }
        let Some(token) = token else {
            return Ok(None);
        };
        let result = operation().await;
        if let Err(err) = self.unlock(key, &token).await {
            tracing::warn!(key = %key, "lock release failed: {}", err);
        }
        Ok(Some(result))
    }

    /// Writes hash fields, optionally stamping the key with a TTL.
    pub async fn hash_put(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl_seconds: Option<i64>,
    ) -> Result<(), StorageError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        cmd.query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        if let Some(ttl) = ttl_seconds {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl.max(1))
                .query_async::<()>(&mut *conn)
                .await
                .map_err(|_| StorageError::Redis)?;
        }
        Ok(())
    }

    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("HGETALL")
            .arg(key)
            .query_async::<HashMap<String, String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async::<Vec<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    pub async fn set_count(&self, key: &str) -> Result<i64, StorageError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SCARD")
            .arg(key)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    pub async fn key_exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock().await;
        let exists: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(exists == 1)
    }

    pub async fn key_expire(&self, key: &str, ttl_seconds: i64) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock().await;
        let refreshed: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds.max(1))
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(refreshed == 1)
    }

    pub async fn key_delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    /// Writes a plain string value with a TTL.
    pub async fn string_put(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_seconds.max(1))
            .arg(value)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    pub async fn string_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    /// Fans a payload out to every subscriber of the channel.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)
    }

    /// Opens a dedicated subscriber connection for the channel. The caller
    /// owns the message loop.
    pub async fn subscribe(&self, channel: &str) -> Result<redis::aio::PubSub, StorageError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|_| StorageError::Redis)?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_tokens_are_opaque_and_distinct() {
        let first = lock_token();
        let second = lock_token();
        assert_eq!(first.len(), 32);
        assert_ne!(first, second);
    }

    async fn test_store() -> Option<SharedStore> {
        let url = match std::env::var("RALLY_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping shared-store test: RALLY_TEST_REDIS_URL not set");
                return None;
            }
        };
        Some(connect(&url).await.expect("redis connection"))
    }

    #[tokio::test]
    async fn lock_excludes_second_holder() -> Result<(), StorageError> {
        let Some(store) = test_store().await else {
            return Ok(());
        };
        let key = format!(
            "lock:test:{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let token = store.try_lock(&key, 5).await?.expect("first acquisition");
        assert!(store.try_lock(&key, 5).await?.is_none());
        // a foreign token must not release the lock
        assert!(!store.unlock(&key, "someone-else").await?);
        assert!(store.try_lock(&key, 5).await?.is_none());
        assert!(store.unlock(&key, &token).await?);
        let reacquired = store.try_lock(&key, 5).await?.expect("reacquisition");
        store.unlock(&key, &reacquired).await?;
        Ok(())
    }

    #[tokio::test]
    async fn sets_and_hashes_roundtrip() -> Result<(), StorageError> {
        let Some(store) = test_store().await else {
            return Ok(());
        };
        let suffix = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let set_key = format!("conns:test:{suffix}");
        store.set_add(&set_key, "conn-1").await?;
        store.set_add(&set_key, "conn-2").await?;
        assert_eq!(store.set_count(&set_key).await?, 2);
        store.set_remove(&set_key, "conn-1").await?;
        assert_eq!(store.set_members(&set_key).await?, vec!["conn-2".to_string()]);
        store.key_delete(&set_key).await?;

        let hash_key = format!("snapshot:test:{suffix}");
        store
            .hash_put(
                &hash_key,
                &[("is_online", "true".to_string()), ("count", "2".to_string())],
                Some(30),
            )
            .await?;
        let fields = store.hash_get_all(&hash_key).await?;
        assert_eq!(fields.get("is_online").map(String::as_str), Some("true"));
        assert!(store.key_exists(&hash_key).await?);
        store.key_delete(&hash_key).await?;
        assert!(!store.key_exists(&hash_key).await?);
        Ok(())
    }
}
