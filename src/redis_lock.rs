//! Redis-backed lease store
//!
//! Acquisition is a single `SET key token NX PX ttl`; release and extension
//! go through server-side Lua so the compare-and-delete / compare-and-expire
//! is atomic with the token check. A latecomer can therefore never release
//! or extend a successor's lease.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::lock::LeaseStore;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLeaseStore {
    client: Client,
    release_script: Script,
    extend_script: Script,
}

impl RedisLeaseStore {
    pub fn new(url: &str) -> CoreResult<Self> {
        let client = Client::open(url)
            .map_err(|e| CoreError::bad_input(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            release_script: Script::new(RELEASE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        })
    }

    async fn conn(&self) -> CoreResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(transient)
    }
}

fn transient(err: redis::RedisError) -> CoreError {
    CoreError::TransientUnavailable(format!("redis: {err}"))
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> CoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let token = Uuid::new_v4().to_string();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(transient)?;
        Ok(reply.map(|_| token))
    }

    async fn release(&self, key: &str, token: &str) -> CoreResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(transient)?;
        Ok(deleted == 1)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> CoreResult<bool> {
        let mut conn = self.conn().await?;
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(transient)?;
        Ok(extended == 1)
    }
}
