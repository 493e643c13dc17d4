//! Forced variations kept in Redis, shared by every agent instance pointing at the same server.
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands};

use crate::{
    override_store::{ForcedVariationStore, OverrideKey},
    Result,
};

/// Override store shared through Redis.
///
/// Each override lives under `{prefix}:{experiment_key length}:{experiment_key}:{user_id}`. The
/// length makes the key unambiguous when experiment keys or user ids contain `:`.
///
/// Replacing and removing use `SET ... GET` and `GETDEL` (Redis 6.2+), so the previous value
/// reported to a caller is the one its own write replaced, even when several agents write the
/// same override concurrently. The facade's per-key lock only orders writers within one process.
pub struct RedisOverrideStore {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisOverrideStore {
    pub const DEFAULT_KEY_PREFIX: &'static str = "decision_agent:overrides";

    /// Connect to `url`. `response_timeout` bounds every command; `None` waits indefinitely.
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        response_timeout: Option<Duration>,
    ) -> Result<RedisOverrideStore> {
        let client = redis::Client::open(url)?;

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        log::debug!(target: "decision_agent", url; "connected to redis override store");

        Ok(RedisOverrideStore {
            connection,
            key_prefix: key_prefix.into(),
        })
    }

    fn redis_key(&self, key: &OverrideKey) -> String {
        redis_key(&self.key_prefix, key)
    }
}

fn redis_key(prefix: &str, key: &OverrideKey) -> String {
    format!(
        "{}:{}:{}:{}",
        prefix,
        key.experiment_key.len(),
        key.experiment_key,
        key.user_id
    )
}

#[async_trait]
impl ForcedVariationStore for RedisOverrideStore {
    async fn get(&self, key: &OverrideKey) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(self.redis_key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &OverrideKey, variation_key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let previous: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(variation_key)
            .arg("GET")
            .query_async(&mut conn)
            .await?;
        Ok(previous)
    }

    async fn remove(&self, key: &OverrideKey) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let removed: Option<String> = redis::cmd("GETDEL")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::{redis_key, RedisOverrideStore};
    use crate::{override_store::OverrideKey, Error};

    #[test]
    fn keys_are_namespaced_by_prefix() {
        assert_eq!(
            redis_key("agent:app1", &OverrideKey::new("exp", "user")),
            "agent:app1:3:exp:user"
        );
    }

    #[test]
    fn separators_in_keys_do_not_collide() {
        let a = redis_key("p", &OverrideKey::new("exp:a", "user"));
        let b = redis_key("p", &OverrideKey::new("exp", "a:user"));
        assert_ne!(a, b);
        assert_eq!(a, "p:5:exp:a:user");
        assert_eq!(b, "p:3:exp:a:user");
    }

    #[tokio::test]
    async fn invalid_url_is_reported() {
        let result = RedisOverrideStore::connect("not a redis url", "prefix", None).await;
        assert!(matches!(result, Err(Error::Redis(_))));
    }
}
