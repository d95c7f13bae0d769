use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::{CoordError, CoordinationStore};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store with the same semantics as the Redis backend.
///
/// A single mutex guards the whole keyspace, so every primitive is trivially atomic.
/// Used by tests and by single-process fleets (`memory://`).
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the slot when it has expired, then hand out the live one.
    fn live<'a>(slots: &'a mut HashMap<String, Slot>, key: &str) -> Option<&'a mut Slot> {
        let now = Instant::now();
        if slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            slots.remove(key);
        }
        slots.get_mut(key)
    }

    fn list_mut<'a>(
        slots: &'a mut HashMap<String, Slot>,
        key: &str,
    ) -> Result<&'a mut VecDeque<String>, CoordError> {
        if Self::live(slots, key).is_none() {
            slots.insert(key.to_string(), Slot::new(Value::List(VecDeque::new()), None));
        }
        match slots.get_mut(key).map(|slot| &mut slot.value) {
            Some(Value::List(list)) => Ok(list),
            _ => Err(CoordError::WrongType {
                key: key.to_string(),
            }),
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut slots = self.slots.lock();
        match Self::live(&mut slots, key).map(|slot| &slot.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(Value::List(_)) => Err(CoordError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError> {
        self.slots.lock().insert(
            key.to_string(),
            Slot::new(Value::Text(value.to_string()), ttl),
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CoordError> {
        let mut slots = self.slots.lock();
        if Self::live(&mut slots, key).is_some() {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot::new(Value::Text(value.to_string()), Some(ttl)),
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CoordError> {
        let mut slots = self.slots.lock();
        let matches = matches!(
            Self::live(&mut slots, key).map(|slot| &slot.value),
            Some(Value::Text(text)) if text == expected
        );
        if matches {
            slots.remove(key);
        }
        Ok(matches)
    }

    async fn del(&self, keys: &[&str]) -> Result<u64, CoordError> {
        let mut slots = self.slots.lock();
        let mut removed = 0;
        for key in keys {
            if Self::live(&mut slots, key).is_some() {
                slots.remove(*key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, CoordError> {
        Ok(Self::live(&mut self.slots.lock(), key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CoordError> {
        let mut slots = self.slots.lock();
        match Self::live(&mut slots, key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CoordError> {
        let mut slots = self.slots.lock();
        let (current, expires_at) = match Self::live(&mut slots, key) {
            None => (0, None),
            Some(Slot {
                value: Value::Text(text),
                expires_at,
            }) => {
                let parsed = text.parse::<i64>().map_err(|_| CoordError::Corrupt {
                    key: key.to_string(),
                    value: text.clone(),
                })?;
                (parsed, *expires_at)
            }
            Some(_) => {
                return Err(CoordError::WrongType {
                    key: key.to_string(),
                })
            }
        };
        let next = current + delta;
        slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn push_back(&self, key: &str, values: &[String]) -> Result<u64, CoordError> {
        let mut slots = self.slots.lock();
        let list = Self::list_mut(&mut slots, key)?;
        list.extend(values.iter().cloned());
        Ok(list.len() as u64)
    }

    async fn push_front(&self, key: &str, values: &[String]) -> Result<u64, CoordError> {
        let mut slots = self.slots.lock();
        let list = Self::list_mut(&mut slots, key)?;
        for value in values {
            list.push_front(value.clone());
        }
        Ok(list.len() as u64)
    }

    async fn pop_front(&self, key: &str, count: usize) -> Result<Vec<String>, CoordError> {
        let mut slots = self.slots.lock();
        if Self::live(&mut slots, key).is_none() {
            return Ok(Vec::new());
        }
        let list = Self::list_mut(&mut slots, key)?;
        let take = count.min(list.len());
        let popped: Vec<String> = list.drain(..take).collect();
        if list.is_empty() {
            slots.remove(key);
        }
        Ok(popped)
    }

    async fn list_len(&self, key: &str) -> Result<u64, CoordError> {
        let mut slots = self.slots.lock();
        match Self::live(&mut slots, key).map(|slot| &slot.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(Value::Text(_)) => Err(CoordError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn trim(&self, key: &str, keep: usize) -> Result<(), CoordError> {
        let mut slots = self.slots.lock();
        if Self::live(&mut slots, key).is_none() {
            return Ok(());
        }
        let list = Self::list_mut(&mut slots, key)?;
        list.truncate(keep);
        if list.is_empty() {
            slots.remove(key);
        }
        Ok(())
    }

    async fn range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>, CoordError> {
        let mut slots = self.slots.lock();
        match Self::live(&mut slots, key).map(|slot| &slot.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list
                .iter()
                .skip(start)
                .take(stop.saturating_sub(start) + 1)
                .cloned()
                .collect()),
            Some(Value::Text(_)) => Err(CoordError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordError> {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        slots.retain(|_, slot| !slot.is_expired(now));
        let mut keys: Vec<String> = slots
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
