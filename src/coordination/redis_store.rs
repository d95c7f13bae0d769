use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;

use super::{CoordError, CoordinationStore};

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const SCAN_PAGE: usize = 200;

/// Coordination store backed by Redis.
///
/// `ConnectionManager` reconnects on its own and is cheap to clone, so every call works
/// on its own clone instead of holding `&mut self`.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisStore {
    /// Connect to `redis_url` (e.g. "redis://127.0.0.1:6379").
    pub async fn new(redis_url: &str) -> Result<Self, CoordError> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        tracing::info!("Connected to coordination store at {}", redis_url);

        Ok(Self {
            connection,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CoordError> {
        // SET NX replies nil when the key exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CoordError> {
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(deleted == 1)
    }

    async fn del(&self, keys: &[&str]) -> Result<u64, CoordError> {
        if keys.is_empty() {
            return Ok(0);
        }
        Ok(self.conn().del(keys).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool, CoordError> {
        Ok(self.conn().exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CoordError> {
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(updated == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CoordError> {
        Ok(self.conn().incr(key, delta).await?)
    }

    async fn push_back(&self, key: &str, values: &[String]) -> Result<u64, CoordError> {
        if values.is_empty() {
            return self.list_len(key).await;
        }
        Ok(self.conn().rpush(key, values).await?)
    }

    async fn push_front(&self, key: &str, values: &[String]) -> Result<u64, CoordError> {
        if values.is_empty() {
            return self.list_len(key).await;
        }
        Ok(self.conn().lpush(key, values).await?)
    }

    async fn pop_front(&self, key: &str, count: usize) -> Result<Vec<String>, CoordError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        // LPOP with a count replies nil for a missing key
        let popped: Option<Vec<String>> = redis::cmd("LPOP")
            .arg(key)
            .arg(count)
            .query_async(&mut self.conn())
            .await?;
        Ok(popped.unwrap_or_default())
    }

    async fn list_len(&self, key: &str) -> Result<u64, CoordError> {
        Ok(self.conn().llen(key).await?)
    }

    async fn trim(&self, key: &str, keep: usize) -> Result<(), CoordError> {
        if keep == 0 {
            let _: u64 = self.conn().del(key).await?;
            return Ok(());
        }
        let _: () = self.conn().ltrim(key, 0, keep as isize - 1).await?;
        Ok(())
    }

    async fn range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>, CoordError> {
        Ok(self
            .conn()
            .lrange(key, start as isize, stop as isize)
            .await?)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordError> {
        let pattern = format!("{}*", prefix);
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
