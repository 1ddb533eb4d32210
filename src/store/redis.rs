//! Redis store.
//!
//! Every [`Store`] operation maps onto one Redis command. Transactions run as
//! a single Lua script, which Redis executes atomically: the script evaluates
//! every check, rejects ops aimed at keys of the wrong type, and only then
//! applies the writes.

use super::{KeyKind, KeyTtl, Store, Transaction};
use crate::{DeferworkError, Result, config::StoreConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{Client, Script, aio::ConnectionManager};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tracing::info;

const COMMIT_SCRIPT: &str = r#"
local tx = cjson.decode(ARGV[1])

for _, check in ipairs(tx.checks) do
  if check.check == 'field_equals' then
    if redis.call('HGET', check.key, check.field) ~= check.value then
      return 0
    end
  elseif check.check == 'is_member' then
    if redis.call('SISMEMBER', check.key, check.member) == 0 then
      return 0
    end
  end
end

local kinds = {
  hash_set = 'hash',
  set_add = 'set',
  set_remove = 'set',
  list_push = 'list',
  list_remove = 'list',
}
for _, op in ipairs(tx.ops) do
  local kind = redis.call('TYPE', op.key).ok
  if kind ~= 'none' and kind ~= kinds[op.op] then
    return redis.error_reply('WRONGTYPE ' .. op.key .. ' holds a ' .. kind)
  end
end

for _, op in ipairs(tx.ops) do
  if op.op == 'hash_set' then
    redis.call('HSET', op.key, op.field, op.value)
  elseif op.op == 'set_add' then
    redis.call('SADD', op.key, op.member)
  elseif op.op == 'set_remove' then
    redis.call('SREM', op.key, op.member)
  elseif op.op == 'list_push' then
    redis.call('RPUSH', op.key, op.value)
  elseif op.op == 'list_remove' then
    redis.call('LREM', op.key, 0, op.value)
  end
end

return 1
"#;

/// A [`Store`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    commit_script: Arc<Script>,
}

impl RedisStore {
    /// Connect to the server at `url`, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Connected to Redis store");
        Ok(Self::from_manager(manager))
    }

    /// Connect using the `[store]` section of the configuration, giving up
    /// after `connection_timeout_secs`.
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        let limit = Duration::from_secs(config.connection_timeout_secs);
        tokio::time::timeout(limit, Self::connect(&config.url))
            .await
            .map_err(|_| DeferworkError::Store {
                message: format!(
                    "Timed out connecting to Redis after {}s",
                    config.connection_timeout_secs
                ),
            })?
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            commit_script: Arc::new(Script::new(COMMIT_SCRIPT)),
        }
    }

    fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Remove every key in the current database. Meant for tests.
    pub async fn flush_db(&self) -> Result<()> {
        let mut con = self.connection();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut con).await?;
        Ok(())
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hash_set(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value.as_slice());
        }
        let mut con = self.connection();
        let _: () = cmd.query_async(&mut con).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut con = self.connection();
        let value: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut con)
            .await?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut con = self.connection();
        let fields: HashMap<String, Vec<u8>> =
            redis::cmd("HGETALL").arg(key).query_async(&mut con).await?;
        Ok(fields)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut con = self.connection();
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut con).await?;
        Ok(count > 0)
    }

    async fn key_kind(&self, key: &str) -> Result<Option<KeyKind>> {
        let mut con = self.connection();
        let kind: String = redis::cmd("TYPE").arg(key).query_async(&mut con).await?;
        Ok(KeyKind::parse(&kind))
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut con = self.connection();
        let deleted: u64 = redis::cmd("DEL").arg(keys).query_async(&mut con).await?;
        Ok(deleted)
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut con = self.connection();
        let applied: i64 = redis::cmd("PEXPIREAT")
            .arg(key)
            .arg(at.timestamp_millis())
            .query_async(&mut con)
            .await?;
        Ok(applied == 1)
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        let mut con = self.connection();
        let removed: i64 = redis::cmd("PERSIST").arg(key).query_async(&mut con).await?;
        Ok(removed == 1)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut con = self.connection();
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut con).await?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            millis => KeyTtl::from_millis(millis),
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut con = self.connection();
        let added: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut con = self.connection();
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut con = self.connection();
        let mut members: Vec<String> =
            redis::cmd("SMEMBERS").arg(key).query_async(&mut con).await?;
        members.sort();
        Ok(members)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut con = self.connection();
        let present: i64 = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(present == 1)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64> {
        let mut con = self.connection();
        let length: u64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut con)
            .await?;
        Ok(length)
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.connection();
        let value: Option<String> = redis::cmd("LPOP").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let mut con = self.connection();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut con)
            .await?;
        Ok(values)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64> {
        let mut con = self.connection();
        let removed: u64 = redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(value)
            .query_async(&mut con)
            .await?;
        Ok(removed)
    }

    async fn commit(&self, tx: &Transaction) -> Result<bool> {
        let payload = serde_json::to_string(tx)?;
        let mut invocation = self.commit_script.prepare_invoke();
        for key in tx.keys() {
            invocation.key(key);
        }
        invocation.arg(payload);

        let mut con = self.connection();
        let applied: i64 = invocation.invoke_async(&mut con).await?;
        Ok(applied == 1)
    }
}
