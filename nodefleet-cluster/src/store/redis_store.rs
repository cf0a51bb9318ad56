//! Redis-backed coordination store
//!
//! Uses a `ConnectionManager` for command traffic (it reconnects on its own)
//! and a dedicated pub/sub connection per subscription. Every call is bounded
//! by the configured operation timeout.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Cmd, FromRedisValue};
use tokio::time::timeout;

use super::{CoordinationStore, Guard, ListEnd, MessageStream, Removal};
use crate::error::{Error, Result};

/// Shared Lua prelude that evaluates guard triples.
///
/// Layout: `ARGV[1]` is the guard count `g`; guard `i` uses `KEYS[i]` and
/// `ARGV[2 + 3(i-1) .. 4 + 3(i-1)]` as (kind, extra, value). On return
/// `a` points at the first unconsumed ARGV and `k` at the first unconsumed key.
const GUARD_PRELUDE: &str = r"
local g = tonumber(ARGV[1])
local a = 2
for i = 1, g do
    local kind = ARGV[a]
    local extra = ARGV[a + 1]
    local value = ARGV[a + 2]
    a = a + 3
    local key = KEYS[i]
    if kind == 'exists' then
        if redis.call('EXISTS', key) == 0 then return 0 end
    elseif kind == 'absent' then
        if redis.call('EXISTS', key) == 1 then return 0 end
    elseif kind == 'not_member' then
        if redis.call('SISMEMBER', key, value) == 1 then return 0 end
    elseif kind == 'field_eq' then
        if redis.call('HGET', key, extra) ~= value then return 0 end
    elseif kind == 'field_absent' then
        if redis.call('HEXISTS', key, extra) == 1 then return 0 end
    end
end
local k = g + 1
";

const SET_ADD_BODY: &str = r"
redis.call('SADD', KEYS[k], ARGV[a])
return 1
";

const DELETE_BODY: &str = r"
local n = tonumber(ARGV[a])
a = a + 1
for i = 1, n do
    redis.call('DEL', KEYS[k])
    k = k + 1
end
while KEYS[k] do
    local op = ARGV[a]
    local member = ARGV[a + 1]
    a = a + 2
    if op == 'srem' then
        redis.call('SREM', KEYS[k], member)
    else
        redis.call('HDEL', KEYS[k], member)
    end
    k = k + 1
end
return 1
";

/// Redis implementation of `CoordinationStore`
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
    op_timeout: Duration,
    set_add_script: redis::Script,
    delete_script: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Open a managed connection to `url`
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let manager = timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))?
            .map_err(|e| Error::Store(format!("Redis connection failed: {e}")))?;

        Ok(Self {
            client,
            manager,
            op_timeout,
            set_add_script: redis::Script::new(&format!("{GUARD_PRELUDE}{SET_ADD_BODY}")),
            delete_script: redis::Script::new(&format!("{GUARD_PRELUDE}{DELETE_BODY}")),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd, op: &str) -> Result<T> {
        let mut conn = self.manager.clone();
        timeout(self.op_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout(format!("Redis {op} timed out")))?
            .map_err(|e| Error::Store(format!("Redis {op} failed: {e}")))
    }

    async fn invoke(&self, invocation: redis::ScriptInvocation<'_>, op: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let held: i64 = timeout(self.op_timeout, invocation.invoke_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout(format!("Redis {op} script timed out")))?
            .map_err(|e| Error::Store(format!("Redis {op} script failed: {e}")))?;
        Ok(held == 1)
    }
}

/// Push the guard keys and argument triples onto a script invocation
fn push_guards(invocation: &mut redis::ScriptInvocation<'_>, guards: &[Guard]) {
    for guard in guards {
        let key = match guard {
            Guard::KeyExists(key) | Guard::KeyAbsent(key) => key,
            Guard::NotMember { set, .. } => set,
            Guard::FieldEquals { hash, .. } => hash,
        };
        invocation.key(key);
    }
    invocation.arg(guards.len());
    for guard in guards {
        let (kind, extra, value) = match guard {
            Guard::KeyExists(_) => ("exists", "", ""),
            Guard::KeyAbsent(_) => ("absent", "", ""),
            Guard::NotMember { member, .. } => ("not_member", "", member.as_str()),
            Guard::FieldEquals {
                field,
                value: Some(value),
                ..
            } => ("field_eq", field.as_str(), value.as_str()),
            Guard::FieldEquals {
                field, value: None, ..
            } => ("field_absent", field.as_str(), ""),
        };
        invocation.arg(kind).arg(extra).arg(value);
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = self
            .query(redis::cmd("SADD").arg(key).arg(member), "SADD")
            .await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self
            .query(redis::cmd("SREM").arg(key).arg(member), "SREM")
            .await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.query(redis::cmd("SMEMBERS").arg(key), "SMEMBERS").await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        self.query(redis::cmd("SISMEMBER").arg(key).arg(member), "SISMEMBER")
            .await
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        self.query::<()>(&cmd, "HSET").await
    }

    async fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.query(
            redis::cmd("HSETNX").arg(key).arg(field).arg(value),
            "HSETNX",
        )
        .await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field), "HGET")
            .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.query(redis::cmd("HGETALL").arg(key), "HGETALL").await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        self.query::<()>(redis::cmd("HDEL").arg(key).arg(field), "HDEL")
            .await
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        self.query(redis::cmd("RPUSH").arg(key).arg(value), "RPUSH")
            .await
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("LPOP").arg(key), "LPOP").await
    }

    async fn list_move(
        &self,
        source: &str,
        destination: &str,
        from: ListEnd,
        to: ListEnd,
    ) -> Result<Option<String>> {
        self.query(
            redis::cmd("LMOVE")
                .arg(source)
                .arg(destination)
                .arg(from.as_redis())
                .arg(to.as_redis()),
            "LMOVE",
        )
        .await
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<bool> {
        let removed: i64 = self
            .query(redis::cmd("LREM").arg(key).arg(1).arg(value), "LREM")
            .await?;
        Ok(removed > 0)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        self.query(redis::cmd("LLEN").arg(key), "LLEN").await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.query::<()>(
            redis::cmd("SET").arg(key).arg(value).arg("PX").arg(millis),
            "SET",
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("GET").arg(key), "GET").await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.query(redis::cmd("EXISTS").arg(key), "EXISTS").await
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.query::<()>(redis::cmd("DEL").arg(keys), "DEL").await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.query(
            redis::cmd("PUBLISH").arg(channel).arg(payload),
            "PUBLISH",
        )
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let mut pubsub = timeout(self.op_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| Error::Timeout("Redis Pub/Sub connection timed out".to_string()))?
            .map_err(|e| Error::Store(format!("Redis Pub/Sub connection failed: {e}")))?;

        timeout(self.op_timeout, pubsub.subscribe(channel))
            .await
            .map_err(|_| Error::Timeout(format!("Subscribe to {channel} timed out")))?
            .map_err(|e| Error::Store(format!("Subscribe to {channel} failed: {e}")))?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(error = %e, "Invalid Pub/Sub payload");
                        None
                    }
                }
            });
        Ok(stream.boxed())
    }

    async fn set_add_guarded(&self, key: &str, member: &str, guards: &[Guard]) -> Result<bool> {
        let mut invocation = self.set_add_script.prepare_invoke();
        push_guards(&mut invocation, guards);
        invocation.key(key).arg(member);
        self.invoke(invocation, "guarded SADD").await
    }

    async fn delete_guarded(
        &self,
        guards: &[Guard],
        keys: &[String],
        removals: &[Removal],
    ) -> Result<bool> {
        let mut invocation = self.delete_script.prepare_invoke();
        push_guards(&mut invocation, guards);
        invocation.arg(keys.len());
        for key in keys {
            invocation.key(key);
        }
        for removal in removals {
            match removal {
                Removal::SetMember { set, member } => {
                    invocation.key(set).arg("srem").arg(member);
                }
                Removal::HashField { hash, field } => {
                    invocation.key(hash).arg("hdel").arg(field);
                }
            }
        }
        self.invoke(invocation, "guarded delete").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect() -> RedisStore {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        RedisStore::connect(&url, Duration::from_secs(2))
            .await
            .expect("Redis available")
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_guarded_add_against_redis() {
        let store = connect().await;
        let prefix = format!("nodefleet-test:{}", nanoid::nanoid!(8));
        let frozen = format!("{prefix}:frozen");
        let active = format!("{prefix}:active");

        store.set_add(&frozen, "n1").await.unwrap();
        let guard = [Guard::NotMember {
            set: frozen.clone(),
            member: "n1".into(),
        }];
        assert!(!store.set_add_guarded(&active, "n1", &guard).await.unwrap());

        store.set_remove(&frozen, "n1").await.unwrap();
        assert!(store.set_add_guarded(&active, "n1", &guard).await.unwrap());
        assert!(store.set_contains(&active, "n1").await.unwrap());

        store.delete(&[active, frozen]).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_guarded_delete_against_redis() {
        let store = connect().await;
        let prefix = format!("nodefleet-test:{}", nanoid::nanoid!(8));
        let status = format!("{prefix}:status");
        let all = format!("{prefix}:all");
        let hb = format!("{prefix}:hb");

        store
            .hash_set(&status, &[("last_seen".into(), "t1".into())])
            .await
            .unwrap();
        store.set_add(&all, "n1").await.unwrap();

        let guards = [
            Guard::KeyAbsent(hb.clone()),
            Guard::FieldEquals {
                hash: status.clone(),
                field: "last_seen".into(),
                value: Some("t1".into()),
            },
        ];
        let removals = [Removal::SetMember {
            set: all.clone(),
            member: "n1".into(),
        }];
        assert!(store
            .delete_guarded(&guards, std::slice::from_ref(&status), &removals)
            .await
            .unwrap());
        assert!(!store.exists(&status).await.unwrap());
        assert!(!store.set_contains(&all, "n1").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_list_move_against_redis() {
        let store = connect().await;
        let prefix = format!("nodefleet-test:{}", nanoid::nanoid!(8));
        let queue = format!("{prefix}:q");
        let processing = format!("{prefix}:p");

        store.list_push(&queue, "a").await.unwrap();
        let moved = store
            .list_move(&queue, &processing, ListEnd::Head, ListEnd::Tail)
            .await
            .unwrap();
        assert_eq!(moved.as_deref(), Some("a"));
        assert!(store.list_remove(&processing, "a").await.unwrap());
        assert_eq!(store.list_len(&processing).await.unwrap(), 0);
    }
}
