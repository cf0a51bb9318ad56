//! In-process coordination store
//!
//! Mirrors the Redis data model closely enough for single-node deployments
//! and tests: typed keys, lazy TTL expiry with a periodic sweep, empty
//! collections disappear, and pub/sub is fire-and-forget over
//! `tokio::sync::broadcast`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{CoordinationStore, Guard, ListEnd, MessageStream, Removal};
use crate::error::{Error, Result};

/// Capacity of each in-process channel; slow subscribers skip ahead
const CHANNEL_CAPACITY: usize = 256;

/// Expired keys nobody reads again are swept after this many TTL writes
const SWEEP_EVERY: usize = 64;

#[derive(Debug)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::Set(s) => s.is_empty(),
            Self::Hash(h) => h.is_empty(),
            Self::List(l) => l.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    const fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    ttl_writes: usize,
}

fn wrong_type(key: &str) -> Error {
    Error::Store(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

impl Keyspace {
    fn purge_if_expired(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    /// Drop every expired key, read or not
    fn sweep_expired(&mut self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let swept = before - self.entries.len();
        if swept > 0 {
            tracing::trace!(swept = swept, "Swept expired keys");
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_if_expired(key);
        self.entries.get_mut(key)
    }

    fn contains(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Drop a collection key once it holds nothing, as Redis does
    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| e.value.is_empty()) {
            self.entries.remove(key);
        }
    }

    fn set(&mut self, key: &str) -> Result<Option<&mut BTreeSet<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_or_insert(&mut self, key: &str) -> Result<&mut BTreeSet<String>> {
        if self.set(key)?.is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::Set(BTreeSet::new())));
        }
        self.set(key)?.ok_or_else(|| wrong_type(key))
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut HashMap<String, String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_or_insert(&mut self, key: &str) -> Result<&mut HashMap<String, String>> {
        if self.hash(key)?.is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }
        self.hash(key)?.ok_or_else(|| wrong_type(key))
    }

    fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(Some(l)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_or_insert(&mut self, key: &str) -> Result<&mut VecDeque<String>> {
        if self.list(key)?.is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
        }
        self.list(key)?.ok_or_else(|| wrong_type(key))
    }

    fn guard_holds(&mut self, guard: &Guard) -> Result<bool> {
        Ok(match guard {
            Guard::KeyExists(key) => self.contains(key),
            Guard::KeyAbsent(key) => !self.contains(key),
            Guard::NotMember { set, member } => {
                !self.set(set)?.is_some_and(|s| s.contains(member))
            }
            Guard::FieldEquals { hash, field, value } => {
                let current = self.hash(hash)?.and_then(|h| h.get(field).cloned());
                current == *value
            }
        })
    }

    fn guards_hold(&mut self, guards: &[Guard]) -> Result<bool> {
        for guard in guards {
            if !self.guard_holds(guard)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// In-memory `CoordinationStore`
#[derive(Debug)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock();
        Ok(ks.set_or_insert(key)?.insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock();
        let removed = ks.set(key)?.is_some_and(|s| s.remove(member));
        ks.drop_if_empty(key);
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut ks = self.keyspace.lock();
        Ok(ks
            .set(key)?
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock();
        Ok(ks.set(key)?.is_some_and(|s| s.contains(member)))
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut ks = self.keyspace.lock();
        let hash = ks.hash_or_insert(key)?;
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock();
        let hash = ks.hash_or_insert(key)?;
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut ks = self.keyspace.lock();
        Ok(ks.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut ks = self.keyspace.lock();
        Ok(ks.hash(key)?.map(|h| h.clone()).unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let mut ks = self.keyspace.lock();
        if let Some(hash) = ks.hash(key)? {
            hash.remove(field);
        }
        ks.drop_if_empty(key);
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        let mut ks = self.keyspace.lock();
        let list = ks.list_or_insert(key)?;
        list.push_back(value.to_string());
        Ok(list.len())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<String>> {
        let mut ks = self.keyspace.lock();
        let popped = ks.list(key)?.and_then(VecDeque::pop_front);
        ks.drop_if_empty(key);
        Ok(popped)
    }

    async fn list_move(
        &self,
        source: &str,
        destination: &str,
        from: ListEnd,
        to: ListEnd,
    ) -> Result<Option<String>> {
        let mut ks = self.keyspace.lock();
        // Type-check the destination before touching the source
        if ks.contains(destination) && ks.list(destination)?.is_none() {
            return Err(wrong_type(destination));
        }
        let Some(list) = ks.list(source)? else {
            return Ok(None);
        };
        let item = match from {
            ListEnd::Head => list.pop_front(),
            ListEnd::Tail => list.pop_back(),
        };
        let Some(item) = item else {
            return Ok(None);
        };
        ks.drop_if_empty(source);
        let dest = ks.list_or_insert(destination)?;
        match to {
            ListEnd::Head => dest.push_front(item.clone()),
            ListEnd::Tail => dest.push_back(item.clone()),
        }
        Ok(Some(item))
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<bool> {
        let mut ks = self.keyspace.lock();
        let removed = match ks.list(key)? {
            Some(list) => match list.iter().position(|v| v == value) {
                Some(idx) => list.remove(idx).is_some(),
                None => false,
            },
            None => false,
        };
        ks.drop_if_empty(key);
        Ok(removed)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut ks = self.keyspace.lock();
        Ok(ks.list(key)?.map_or(0, |l| l.len()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut ks = self.keyspace.lock();
        ks.ttl_writes += 1;
        if ks.ttl_writes % SWEEP_EVERY == 0 {
            ks.sweep_expired();
        }
        ks.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut ks = self.keyspace.lock();
        match ks.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.keyspace.lock().contains(key))
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut ks = self.keyspace.lock();
        for key in keys {
            ks.entries.remove(key);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        // No subscribers is not an error: delivery is best effort
        Ok(self.sender(channel).send(payload.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let rx = self.sender(channel).subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn set_add_guarded(&self, key: &str, member: &str, guards: &[Guard]) -> Result<bool> {
        let mut ks = self.keyspace.lock();
        if !ks.guards_hold(guards)? {
            return Ok(false);
        }
        ks.set_or_insert(key)?.insert(member.to_string());
        Ok(true)
    }

    async fn delete_guarded(
        &self,
        guards: &[Guard],
        keys: &[String],
        removals: &[Removal],
    ) -> Result<bool> {
        let mut ks = self.keyspace.lock();
        if !ks.guards_hold(guards)? {
            return Ok(false);
        }
        for key in keys {
            ks.entries.remove(key);
        }
        for removal in removals {
            match removal {
                Removal::SetMember { set, member } => {
                    if let Some(s) = ks.set(set)? {
                        s.remove(member);
                    }
                    ks.drop_if_empty(set);
                }
                Removal::HashField { hash, field } => {
                    if let Some(h) = ks.hash(hash)? {
                        h.remove(field);
                    }
                    ks.drop_if_empty(hash);
                }
            }
        }
        Ok(true)
    }
}
