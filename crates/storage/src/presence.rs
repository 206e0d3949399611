use crate::StorageError;
use crate::shared::SharedStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

fn presence_key(user_id: &str) -> String {
    format!("presence:{user_id}")
}

fn connection_set_key(user_id: &str) -> String {
    format!("user_conn:{user_id}")
}

fn connection_key(connection_id: &str) -> String {
    format!("conn:{connection_id}")
}

/// Advisory view of a user's live connections. Never authoritative for the
/// state machine; it only drives the "attempt live delivery now?" decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub connection_count: i64,
}

impl PresenceSnapshot {
    fn offline() -> Self {
        PresenceSnapshot {
            is_online: false,
            last_seen: None,
            connection_count: 0,
        }
    }
}

fn parse_snapshot(fields: &HashMap<String, String>) -> PresenceSnapshot {
    if fields.is_empty() {
        return PresenceSnapshot::offline();
    }
    let is_online = fields
        .get("is_online")
        .map(|value| value == "true")
        .unwrap_or(false);
    let last_seen = fields
        .get("last_seen")
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc));
    let connection_count = fields
        .get("connection_count")
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0);
    PresenceSnapshot {
        is_online,
        last_seen,
        connection_count,
    }
}

/// Cluster-wide registry of live connections, keyed per user. All entries
/// carry TTLs so state left behind by a dead worker self-expires.
#[derive(Clone)]
pub struct PresenceRegistry {
    shared: SharedStore,
    ttl_seconds: i64,
}

impl PresenceRegistry {
    pub fn new(shared: SharedStore, ttl_seconds: i64) -> Self {
        PresenceRegistry {
            shared,
            ttl_seconds,
        }
    }

    async fn write_snapshot(&self, user_id: &str, count: i64) -> Result<(), StorageError> {
        let fields = [
            (
                "is_online",
                if count > 0 { "true" } else { "false" }.to_string(),
            ),
            ("last_seen", Utc::now().to_rfc3339()),
            ("connection_count", count.to_string()),
        ];
        self.shared
            .hash_put(&presence_key(user_id), &fields, Some(self.ttl_seconds))
            .await
    }

    /// Registers a connection and rewrites the user's presence snapshot.
    pub async fn set_online(&self, user_id: &str, connection_id: &str) -> Result<(), StorageError> {
        let set_key = connection_set_key(user_id);
        self.shared.set_add(&set_key, connection_id).await?;
        self.shared.key_expire(&set_key, self.ttl_seconds).await?;
        self.shared
            .string_put(&connection_key(connection_id), user_id, self.ttl_seconds)
            .await?;
        let count = self.shared.set_count(&set_key).await?;
        self.write_snapshot(user_id, count).await
    }

    /// Deregisters a connection; the user goes offline when the last
    /// connection disappears.
    pub async fn set_offline(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<(), StorageError> {
        let set_key = connection_set_key(user_id);
        self.shared.set_remove(&set_key, connection_id).await?;
        self.shared.key_delete(&connection_key(connection_id)).await?;
        let count = self.shared.set_count(&set_key).await?;
        self.write_snapshot(user_id, count).await
    }

    /// Refreshes an existing presence record. A heartbeat never creates one:
    /// a user whose presence already expired stays offline until a
    /// connection re-registers.
    pub async fn heartbeat(&self, user_id: &str) -> Result<bool, StorageError> {
        let hash_key = presence_key(user_id);
        if !self.shared.key_exists(&hash_key).await? {
            return Ok(false);
        }
        let fields = [("last_seen", Utc::now().to_rfc3339())];
        self.shared
            .hash_put(&hash_key, &fields, Some(self.ttl_seconds))
            .await?;
        let set_key = connection_set_key(user_id);
        self.shared.key_expire(&set_key, self.ttl_seconds).await?;
        for connection_id in self.shared.set_members(&set_key).await? {
            self.shared
                .key_expire(&connection_key(&connection_id), self.ttl_seconds)
                .await?;
        }
        Ok(true)
    }

    pub async fn is_online(&self, user_id: &str) -> Result<bool, StorageError> {
        let count = self
            .shared
            .set_count(&connection_set_key(user_id))
            .await?;
        Ok(count > 0)
    }

    pub async fn connections(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        self.shared.set_members(&connection_set_key(user_id)).await
    }

    pub async fn user_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<String>, StorageError> {
        self.shared.string_get(&connection_key(connection_id)).await
    }

    pub async fn snapshot(&self, user_id: &str) -> Result<PresenceSnapshot, StorageError> {
        let fields = self.shared.hash_get_all(&presence_key(user_id)).await?;
        Ok(parse_snapshot(&fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared;

    #[test]
    fn key_namespaces_are_stable() {
        assert_eq!(presence_key("u-1"), "presence:u-1");
        assert_eq!(connection_set_key("u-1"), "user_conn:u-1");
        assert_eq!(connection_key("c-9"), "conn:c-9");
    }

    #[test]
    fn snapshot_parsing_defaults_to_offline() {
        assert_eq!(parse_snapshot(&HashMap::new()), PresenceSnapshot::offline());
        let mut fields = HashMap::new();
        fields.insert("is_online".to_string(), "true".to_string());
        fields.insert("connection_count".to_string(), "2".to_string());
        fields.insert(
            "last_seen".to_string(),
            "2026-01-05T10:00:00+00:00".to_string(),
        );
        let snapshot = parse_snapshot(&fields);
        assert!(snapshot.is_online);
        assert_eq!(snapshot.connection_count, 2);
        assert!(snapshot.last_seen.is_some());
    }

    #[test]
    fn snapshot_parsing_tolerates_garbage() {
        let mut fields = HashMap::new();
        fields.insert("is_online".to_string(), "yes".to_string());
        fields.insert("connection_count".to_string(), "many".to_string());
        fields.insert("last_seen".to_string(), "noon".to_string());
        let snapshot = parse_snapshot(&fields);
        assert!(!snapshot.is_online);
        assert_eq!(snapshot.connection_count, 0);
        assert!(snapshot.last_seen.is_none());
    }

    #[tokio::test]
    async fn multi_device_presence_flow() -> Result<(), StorageError> {
        let url = match std::env::var("RALLY_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping multi_device_presence_flow: RALLY_TEST_REDIS_URL not set");
                return Ok(());
            }
        };
        let store = shared::connect(&url).await?;
        let registry = PresenceRegistry::new(store, 60);
        let user = format!(
            "user-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        registry.set_online(&user, "conn-1").await?;
        registry.set_online(&user, "conn-2").await?;
        assert!(registry.is_online(&user).await?);
        assert_eq!(registry.connections(&user).await?.len(), 2);
        assert_eq!(
            registry.user_for_connection("conn-1").await?,
            Some(user.clone())
        );

        registry.set_offline(&user, "conn-1").await?;
        assert!(registry.is_online(&user).await?);
        let snapshot = registry.snapshot(&user).await?;
        assert!(snapshot.is_online);
        assert_eq!(snapshot.connection_count, 1);

        registry.set_offline(&user, "conn-2").await?;
        assert!(!registry.is_online(&user).await?);
        let snapshot = registry.snapshot(&user).await?;
        assert!(!snapshot.is_online);
        assert_eq!(snapshot.connection_count, 0);

        // heartbeat refreshes an existing record but never creates one
        assert!(registry.heartbeat(&user).await?);
        let ghost = format!("{user}-ghost");
        assert!(!registry.heartbeat(&ghost).await?);
        assert!(!registry.is_online(&ghost).await?);
        Ok(())
    }
}
