//! The snapshot cache in `Dragonfly` (Redis-compatible).
//!
//! Each aggregate owns two hashes that always change together. Wholesale
//! replaces run in one `MULTI`/`EXEC` block. The two conditional writes run
//! as Lua scripts, which execute atomically on the server, so the version
//! comparison and the write cannot be split by another client.
//!
//! Versions are compared as Lua numbers, which are exact up to 2^53.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `{type}_snapshots_for_{id}` | Hash | Snapshot key to JSON entry |
//! | `{type}_snapshot_versions_for_{id}` | Hash | Snapshot key to version, plus `current_version` |

use std::collections::HashMap;

use async_trait::async_trait;
use evstore_core::{HashGuard, HashWrite, SnapshotCache, SnapshotWrite, StoreError};
use fred::interfaces::LuaInterface;
use fred::prelude::*;
use fred::types::Value;

use crate::error::DbError;

/// Set each field whose stored version is absent or older, then raise the
/// current version.
///
/// `KEYS`: versions hash, entries hash. `ARGV`: current field, then
/// `field, version, value` triples. Returns the number of fields written.
const WRITE_IF_NEWER: &str = r"
local written = 0
local top = nil
local top_raw = nil
for i = 2, #ARGV, 3 do
  local version = tonumber(ARGV[i + 1])
  local held = tonumber(redis.call('HGET', KEYS[1], ARGV[i]))
  if held == nil or held < version then
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
    redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 2])
    written = written + 1
    if top == nil or version > top then
      top = version
      top_raw = ARGV[i + 1]
    end
  end
end
if top ~= nil then
  local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1]))
  if current == nil or current < top then
    redis.call('HSET', KEYS[1], ARGV[1], top_raw)
  end
end
return written
";

/// Replace hashes only while the guard hash holds exactly the expected pairs.
///
/// `KEYS`: guard hash, then each hash to replace. `ARGV`: expected pair
/// count and pairs, then per replaced hash its field count and pairs.
/// Returns 1 if the replace ran, 0 otherwise.
const REPLACE_IF_UNCHANGED: &str = r"
local n = tonumber(ARGV[1])
local expected = {}
local pos = 2
for i = 1, n do
  expected[ARGV[pos]] = ARGV[pos + 1]
  pos = pos + 2
end
local held = redis.call('HGETALL', KEYS[1])
if #held ~= n * 2 then
  return 0
end
for i = 1, #held, 2 do
  if expected[held[i]] ~= held[i + 1] then
    return 0
  end
end
for k = 2, #KEYS do
  redis.call('DEL', KEYS[k])
  local count = tonumber(ARGV[pos])
  pos = pos + 1
  for i = 1, count do
    redis.call('HSET', KEYS[k], ARGV[pos], ARGV[pos + 1])
    pos = pos + 2
  end
end
return 1
";

/// `KEYS` and `ARGV` for [`WRITE_IF_NEWER`].
fn write_if_newer_args(write: SnapshotWrite) -> (Vec<String>, Vec<String>) {
    let keys = vec![write.versions_key, write.entries_key];
    let mut args = Vec::with_capacity(write.fields.len().saturating_mul(3).saturating_add(1));
    args.push(write.current_field);
    for field in write.fields {
        args.push(field.field);
        args.push(field.version.to_string());
        args.push(field.value);
    }
    (keys, args)
}

/// `KEYS` and `ARGV` for [`REPLACE_IF_UNCHANGED`].
fn replace_if_unchanged_args(
    guard: &HashGuard,
    writes: Vec<HashWrite>,
) -> (Vec<String>, Vec<String>) {
    let mut keys = Vec::with_capacity(writes.len().saturating_add(1));
    keys.push(guard.key.clone());
    let mut args = vec![guard.expected.len().to_string()];
    for (field, value) in &guard.expected {
        args.push(field.clone());
        args.push(value.clone());
    }
    for write in writes {
        keys.push(write.key);
        args.push(write.fields.len().to_string());
        for (field, value) in write.fields {
            args.push(field);
            args.push(value);
        }
    }
    (keys, args)
}

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
}

impl DragonflyPool {
    /// Connect to `Dragonfly` at `url` (`redis://host:port` or `redis://host:port/db`).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self { client })
    }

    async fn exists_key(&self, key: &str) -> Result<bool, DbError> {
        let count: u32 = self.client.exists(key).await?;
        Ok(count > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, DbError> {
        Ok(self.client.hgetall(key).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, DbError> {
        Ok(self.client.hget(key, field).await?)
    }

    /// Delete and rewrite each hash of `writes` in one transaction.
    async fn replace(&self, writes: Vec<HashWrite>) -> Result<(), DbError> {
        if writes.is_empty() {
            return Ok(());
        }
        let trx = self.client.multi();
        for write in writes {
            let _: () = trx.del(write.key.as_str()).await?;
            if write.fields.is_empty() {
                continue;
            }
            let fields: HashMap<String, String> = write.fields.into_iter().collect();
            let _: () = trx.hset(write.key.as_str(), fields).await?;
        }
        let _: Value = trx.exec(true).await?;
        Ok(())
    }

    async fn compare_and_write(&self, write: SnapshotWrite) -> Result<usize, DbError> {
        if write.fields.is_empty() {
            return Ok(0);
        }
        let (keys, args) = write_if_newer_args(write);
        let written: usize = self.client.eval(WRITE_IF_NEWER, keys, args).await?;
        Ok(written)
    }

    async fn compare_and_replace(
        &self,
        guard: &HashGuard,
        writes: Vec<HashWrite>,
    ) -> Result<bool, DbError> {
        let (keys, args) = replace_if_unchanged_args(guard, writes);
        let replaced: i64 = self.client.eval(REPLACE_IF_UNCHANGED, keys, args).await?;
        Ok(replaced == 1)
    }

    async fn del(&self, keys: &[String]) -> Result<(), DbError> {
        if keys.is_empty() {
            return Ok(());
        }
        let _: u32 = self.client.del(keys.to_vec()).await?;
        Ok(())
    }

    /// Flush all keys from the `Dragonfly` instance.
    ///
    /// **WARNING:** This deletes all data. Only use for testing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the flush fails.
    pub async fn flush_all(&self) -> Result<(), DbError> {
        let _: () = self.client.flushall(false).await?;
        Ok(())
    }

    /// Return a reference to the underlying [`Client`].
    pub const fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl SnapshotCache for DragonflyPool {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.exists_key(key).await.map_err(DbError::into_cache_error)
    }

    async fn read_hash(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.hgetall(key).await.map_err(DbError::into_cache_error)
    }

    async fn read_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.hget(key, field).await.map_err(DbError::into_cache_error)
    }

    async fn write_if_newer(&self, write: SnapshotWrite) -> Result<usize, StoreError> {
        self.compare_and_write(write)
            .await
            .map_err(DbError::into_cache_error)
    }

    async fn replace_hashes(&self, writes: Vec<HashWrite>) -> Result<(), StoreError> {
        self.replace(writes).await.map_err(DbError::into_cache_error)
    }

    async fn replace_hashes_if(
        &self,
        guard: &HashGuard,
        writes: Vec<HashWrite>,
    ) -> Result<bool, StoreError> {
        self.compare_and_replace(guard, writes)
            .await
            .map_err(DbError::into_cache_error)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.del(keys).await.map_err(DbError::into_cache_error)
    }
}
