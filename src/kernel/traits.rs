use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::LogIndex;

// =============================================================================
// CONSENSUS TIME
// =============================================================================

/// Nanoseconds since the Unix epoch, as assigned by the leader and agreed
/// through the log. Handlers must use this instead of the system clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockTime(pub u64);

impl BlockTime {
    pub fn from_nanos(nanos: u64) -> Self {
        BlockTime(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Whether an operation may mutate state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationCategory {
    Command,
    Query,
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationCategory::Command => write!(f, "command"),
            OperationCategory::Query => write!(f, "query"),
        }
    }
}

/// An encoded user operation: a handler name plus bincode arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub data: Vec<u8>,
}

impl Operation {
    pub fn command<C: CommandOp>(op: &C) -> Result<Self, OperationError> {
        Self::encode(C::NAME, op)
    }

    pub fn query<Q: QueryOp>(op: &Q) -> Result<Self, OperationError> {
        Self::encode(Q::NAME, op)
    }

    fn encode<T: Serialize>(name: &str, op: &T) -> Result<Self, OperationError> {
        let data = bincode::serialize(op).map_err(|e| OperationError::Encode {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Operation {
            name: name.to_string(),
            data,
        })
    }
}

/// Decode the output bytes returned for an operation.
pub fn decode_output<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, OperationError> {
    bincode::deserialize(bytes).map_err(|e| OperationError::Decode {
        name: std::any::type_name::<T>().to_string(),
        reason: e.to_string(),
    })
}

/// A state-mutating operation.
pub trait CommandOp: Serialize + DeserializeOwned {
    /// Handler table key. Unique among commands of one state machine.
    const NAME: &'static str;
    type Output: Serialize + DeserializeOwned;
}

/// A read-only operation.
pub trait QueryOp: Serialize + DeserializeOwned {
    const NAME: &'static str;
    type Output: Serialize + DeserializeOwned;
}

/// Deterministic operation failures. These are results, not faults: every
/// node produces the same one for the same entry.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum OperationError {
    #[error("no {category} handler registered for '{name}'")]
    UnknownOperation {
        category: OperationCategory,
        name: String,
    },

    #[error("failed to decode '{name}': {reason}")]
    Decode { name: String, reason: String },

    #[error("failed to encode '{name}': {reason}")]
    Encode { name: String, reason: String },

    /// The sequence was applied earlier and its cached result was already
    /// acknowledged and released.
    #[error("sequence {sequence} of session {session_id} was already applied")]
    StaleSequence { session_id: u64, sequence: u64 },

    #[error("{0}")]
    Application(String),
}

pub type OperationResult = Result<Vec<u8>, OperationError>;

// =============================================================================
// COMMIT
// =============================================================================

/// An operation as seen by a handler, with its position in the log.
#[derive(Clone, Debug)]
pub struct Commit<T> {
    /// Log index of the command, or the applied index a query was served at.
    pub index: LogIndex,
    pub session_id: u64,
    pub sequence: u64,
    pub time: BlockTime,
    pub operation: T,
}

impl<T> Commit<T> {
    pub fn with<U>(&self, operation: U) -> Commit<U> {
        Commit {
            index: self.index,
            session_id: self.session_id,
            sequence: self.sequence,
            time: self.time,
            operation,
        }
    }
}

// =============================================================================
// HANDLER REGISTRY
// =============================================================================

type CommandFn<S> = Box<dyn Fn(&mut S, Commit<&Operation>) -> OperationResult + Send>;
type QueryFn<S> = Box<dyn Fn(&S, Commit<&Operation>) -> OperationResult + Send>;

/// Handlers keyed by operation category and name.
pub struct HandlerRegistry<S> {
    commands: HashMap<&'static str, CommandFn<S>>,
    queries: HashMap<&'static str, QueryFn<S>>,
}

impl<S: 'static> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> HandlerRegistry<S> {
    pub fn new() -> Self {
        HandlerRegistry {
            commands: HashMap::new(),
            queries: HashMap::new(),
        }
    }

    /// Register the handler for command type `C`. A later registration for
    /// the same name replaces the earlier one.
    pub fn register_command<C, F>(&mut self, handler: F)
    where
        C: CommandOp + 'static,
        F: Fn(&mut S, Commit<C>) -> C::Output + Send + 'static,
    {
        self.commands.insert(
            C::NAME,
            boxed_command(move |state, commit| {
                let op: C = decode_operation(commit.operation)?;
                let output = handler(state, commit.with(op));
                encode_output(C::NAME, &output)
            }),
        );
    }

    pub fn register_query<Q, F>(&mut self, handler: F)
    where
        Q: QueryOp + 'static,
        F: Fn(&S, Commit<Q>) -> Q::Output + Send + 'static,
    {
        self.queries.insert(
            Q::NAME,
            boxed_query(move |state, commit| {
                let op: Q = decode_operation(commit.operation)?;
                let output = handler(state, commit.with(op));
                encode_output(Q::NAME, &output)
            }),
        );
    }

    pub fn apply_command(&self, state: &mut S, commit: Commit<&Operation>) -> OperationResult {
        match self.commands.get(commit.operation.name.as_str()) {
            Some(handler) => handler(state, commit),
            None => Err(OperationError::UnknownOperation {
                category: OperationCategory::Command,
                name: commit.operation.name.clone(),
            }),
        }
    }

    pub fn apply_query(&self, state: &S, commit: Commit<&Operation>) -> OperationResult {
        match self.queries.get(commit.operation.name.as_str()) {
            Some(handler) => handler(state, commit),
            None => Err(OperationError::UnknownOperation {
                category: OperationCategory::Query,
                name: commit.operation.name.clone(),
            }),
        }
    }

    pub fn contains(&self, category: OperationCategory, name: &str) -> bool {
        match category {
            OperationCategory::Command => self.commands.contains_key(name),
            OperationCategory::Query => self.queries.contains_key(name),
        }
    }
}

fn boxed_command<S, F>(f: F) -> CommandFn<S>
where
    F: Fn(&mut S, Commit<&Operation>) -> OperationResult + Send + 'static,
{
    Box::new(f)
}

fn boxed_query<S, F>(f: F) -> QueryFn<S>
where
    F: Fn(&S, Commit<&Operation>) -> OperationResult + Send + 'static,
{
    Box::new(f)
}

fn decode_operation<T: DeserializeOwned>(op: &Operation) -> Result<T, OperationError> {
    bincode::deserialize(&op.data).map_err(|e| OperationError::Decode {
        name: op.name.clone(),
        reason: e.to_string(),
    })
}

fn encode_output<T: Serialize>(name: &str, output: &T) -> OperationResult {
    bincode::serialize(output).map_err(|e| OperationError::Encode {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// STATE MACHINE TRAIT
// =============================================================================

/// The contract for user state machines.
///
/// # Laws
///
/// 1. Command handlers are deterministic: the same sequence of commits
///    produces the same state and outputs on every node.
/// 2. Commands are applied one at a time, in log order.
/// 3. Query handlers do not mutate state.
/// 4. `restore(snapshot())` reproduces the state exactly.
///
/// A panic inside a handler halts the executor.
pub trait StateMachine: Send + 'static {
    /// Fill the handler table. Called once per executor.
    fn configure(registry: &mut HandlerRegistry<Self>)
    where
        Self: Sized;

    fn snapshot(&self) -> Vec<u8>;

    fn restore(&mut self, data: &[u8]) -> Result<(), OperationError>;

    /// Called when a session is closed or expires, after it is removed.
    fn session_closed(&mut self, _session_id: u64) {}
}
