//! Reference state machine: a string key-value store.
//!
//! Small enough to reason about in tests, rich enough to exercise every
//! executor path (outputs, queries, snapshots, session callbacks and the
//! poison pill).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kernel::traits::{CommandOp, HandlerRegistry, OperationError, QueryOp, StateMachine};

// =============================================================================
// STATE
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStore {
    values: BTreeMap<String, String>,
    counters: BTreeMap<String, u64>,
    /// Sessions whose close or expiry this store has observed.
    closed_sessions: Vec<u64>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn closed_sessions(&self) -> &[u64] {
        &self.closed_sessions
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Set `key`, returning the previous value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Put {
    pub key: String,
    pub value: String,
}

impl CommandOp for Put {
    const NAME: &'static str = "kv.put";
    type Output = Option<String>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delete {
    pub key: String,
}

impl CommandOp for Delete {
    const NAME: &'static str = "kv.delete";
    type Output = Option<String>;
}

/// Add `by` to a counter and return the new value. Retrying a failed
/// request must not count twice, which makes this the exactly-once check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Increment {
    pub key: String,
    pub by: u64,
}

impl CommandOp for Increment {
    const NAME: &'static str = "kv.increment";
    type Output = u64;
}

/// Returns its argument unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Echo(pub String);

impl CommandOp for Echo {
    const NAME: &'static str = "kv.echo";
    type Output = String;
}

/// Panics inside the handler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Crash;

impl CommandOp for Crash {
    const NAME: &'static str = "kv.crash";
    type Output = ();
}

// =============================================================================
// QUERIES
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Get {
    pub key: String,
}

impl QueryOp for Get {
    const NAME: &'static str = "kv.get";
    type Output = Option<String>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadCounter {
    pub key: String,
}

impl QueryOp for ReadCounter {
    const NAME: &'static str = "kv.counter";
    type Output = u64;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EchoQuery(pub String);

impl QueryOp for EchoQuery {
    const NAME: &'static str = "kv.echo";
    type Output = String;
}

// =============================================================================
// STATE MACHINE
// =============================================================================

impl StateMachine for KvStore {
    fn configure(registry: &mut HandlerRegistry<Self>) {
        registry.register_command::<Put, _>(|store: &mut KvStore, commit| {
            let Put { key, value } = commit.operation;
            store.values.insert(key, value)
        });
        registry.register_command::<Delete, _>(|store: &mut KvStore, commit| {
            store.values.remove(&commit.operation.key)
        });
        registry.register_command::<Increment, _>(|store: &mut KvStore, commit| {
            let counter = store.counters.entry(commit.operation.key).or_insert(0);
            *counter = counter.saturating_add(commit.operation.by);
            *counter
        });
        registry.register_command::<Echo, _>(|_: &mut KvStore, commit| commit.operation.0);
        registry.register_command::<Crash, _>(|_: &mut KvStore, commit| {
            panic!("crash requested at index {}", commit.index)
        });

        registry.register_query::<Get, _>(|store: &KvStore, commit| {
            store.values.get(&commit.operation.key).cloned()
        });
        registry.register_query::<ReadCounter, _>(|store: &KvStore, commit| {
            store.counter(&commit.operation.key)
        });
        registry.register_query::<EchoQuery, _>(|_: &KvStore, commit| commit.operation.0);
    }

    fn snapshot(&self) -> Vec<u8> {
        // Plain maps of strings and integers always serialize.
        bincode::serialize(self).unwrap_or_default()
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), OperationError> {
        *self = bincode::deserialize(data).map_err(|e| OperationError::Decode {
            name: "kv.snapshot".to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn session_closed(&mut self, session_id: u64) {
        self.closed_sessions.push(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::traits::{decode_output, BlockTime, Commit, Operation};

    fn commit(op: &Operation) -> Commit<&Operation> {
        Commit {
            index: 1,
            session_id: 1,
            sequence: 1,
            time: BlockTime(0),
            operation: op,
        }
    }

    #[test]
    fn test_put_get_delete() {
        let mut registry = HandlerRegistry::new();
        KvStore::configure(&mut registry);
        let mut store = KvStore::new();

        let put = Operation::command(&Put { key: "a".into(), value: "1".into() }).unwrap();
        let out = registry.apply_command(&mut store, commit(&put)).unwrap();
        assert_eq!(decode_output::<Option<String>>(&out).unwrap(), None);
        assert_eq!(store.value("a"), Some("1"));

        let get = Operation::query(&Get { key: "a".into() }).unwrap();
        let out = registry.apply_query(&store, commit(&get)).unwrap();
        assert_eq!(decode_output::<Option<String>>(&out).unwrap(), Some("1".to_string()));

        let delete = Operation::command(&Delete { key: "a".into() }).unwrap();
        let out = registry.apply_command(&mut store, commit(&delete)).unwrap();
        assert_eq!(decode_output::<Option<String>>(&out).unwrap(), Some("1".to_string()));
        assert_eq!(store.value("a"), None);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut registry = HandlerRegistry::new();
        KvStore::configure(&mut registry);
        let mut store = KvStore::new();
        let inc = Operation::command(&Increment { key: "n".into(), by: 3 }).unwrap();
        registry.apply_command(&mut store, commit(&inc)).unwrap();
        store.session_closed(9);

        let mut restored = KvStore::new();
        restored.restore(&store.snapshot()).unwrap();
        assert_eq!(restored, store);
        assert_eq!(restored.counter("n"), 3);
        assert!(restored.restore(&[0xFF]).is_err());
    }
}
