//! Coordination store client
//!
//! A thin adapter over the shared-state service. Every method maps to one
//! atomic store operation; multi-key sequences are the caller's business.
//! The two guarded operations exist so that "check then write" steps run
//! as a single atomic unit on the server.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// Stream of raw payloads received on a subscribed channel
pub type MessageStream = BoxStream<'static, String>;

/// Precondition evaluated atomically by guarded operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    KeyExists(String),
    KeyAbsent(String),
    NotMember { set: String, member: String },
    /// Hash field equals `value`; `None` means the field must be missing
    FieldEquals {
        hash: String,
        field: String,
        value: Option<String>,
    },
}

/// Secondary removal performed by `delete_guarded`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    SetMember { set: String, member: String },
    HashField { hash: String, field: String },
}

/// End of a list for move operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Head,
    Tail,
}

impl ListEnd {
    const fn as_redis(self) -> &'static str {
        match self {
            Self::Head => "LEFT",
            Self::Tail => "RIGHT",
        }
    }
}

/// Primitive operations the engine needs from the coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Returns true when the member was newly added
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;
    /// Returns true when the member was present
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
    /// Returns true when the field did not exist and was written
    async fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hash_delete(&self, key: &str, field: &str) -> Result<()>;

    /// Append to the tail, returns the new length
    async fn list_push(&self, key: &str, value: &str) -> Result<usize>;
    /// Pop from the head (FIFO with `list_push`)
    async fn list_pop(&self, key: &str) -> Result<Option<String>>;
    /// Atomically move one element between lists
    async fn list_move(
        &self,
        source: &str,
        destination: &str,
        from: ListEnd,
        to: ListEnd,
    ) -> Result<Option<String>>;
    /// Remove the first occurrence of `value`, returns true if one was removed
    async fn list_remove(&self, key: &str, value: &str) -> Result<bool>;
    async fn list_len(&self, key: &str) -> Result<usize>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Returns the number of subscribers that received the message
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;

    /// Add `member` to `key` only if every guard holds. Returns whether the
    /// guards held.
    async fn set_add_guarded(&self, key: &str, member: &str, guards: &[Guard]) -> Result<bool>;

    /// Delete `keys` and apply `removals` only if every guard holds. Returns
    /// whether the guards held.
    async fn delete_guarded(
        &self,
        guards: &[Guard],
        keys: &[String],
        removals: &[Removal],
    ) -> Result<bool>;
}
