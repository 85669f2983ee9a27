//! Applying one committed entry.

use std::panic::{self, AssertUnwindSafe};

use crate::engine::{EntryKind, LogEntry, NodeId};
use crate::kernel::session::{Registration, SequenceCheck};
use crate::kernel::traits::{BlockTime, Commit, Operation, OperationError, StateMachine};

use super::error::{Applied, ApplyOutcome, ExecutorError, ExecutorStatus};
use super::{panic_message, Executor};

impl<S: StateMachine> Executor<S> {
    /// Apply the entry at `last_applied + 1`.
    ///
    /// # Semantics
    ///
    /// 1. Refuse if halted or if `entry.index != last_applied + 1`
    /// 2. Advance log time to the entry's timestamp (never backwards)
    /// 3. Dispatch on the entry kind
    /// 4. Advance the cursor and return what the entry produced
    ///
    /// A command for a session that is not open, a duplicate sequence or an
    /// undecodable operation still advances the cursor: those outcomes are
    /// deterministic and identical on every node. A handler panic does not;
    /// the executor halts with the cursor left before the poisoned entry.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<ApplyOutcome, ExecutorError> {
        if self.status == ExecutorStatus::Halted {
            return Err(ExecutorError::Halted);
        }
        let expected = self.last_applied + 1;
        if entry.index != expected {
            return Err(ExecutorError::OutOfOrder {
                expected,
                found: entry.index,
            });
        }

        let now = BlockTime(self.last_time.0.max(entry.timestamp_ns));
        let applied = match entry.kind {
            EntryKind::NoOp => Applied::NoOp,
            EntryKind::QueryMarker => Applied::QueryMarker,
            EntryKind::Command => self.apply_command(entry, now)?,
            EntryKind::Configuration => {
                let members: Vec<NodeId> =
                    bincode::deserialize(&entry.payload).map_err(|e| ExecutorError::MalformedEntry {
                        index: entry.index,
                        kind: "configuration",
                        reason: e.to_string(),
                    })?;
                tracing::info!(index = entry.index, ?members, "applied configuration");
                self.members = members.clone();
                Applied::Configuration { members }
            }
            EntryKind::Register => {
                let registration: Registration =
                    bincode::deserialize(&entry.payload).map_err(|e| ExecutorError::MalformedEntry {
                        index: entry.index,
                        kind: "register",
                        reason: e.to_string(),
                    })?;
                let superseded = self.sessions.register(
                    entry.index,
                    registration.client_id,
                    registration.timeout_ns,
                    now.0,
                );
                if let Some(old) = superseded {
                    self.machine.session_closed(old);
                }
                tracing::debug!(
                    session_id = entry.index,
                    client_id = registration.client_id,
                    ?superseded,
                    "session registered"
                );
                Applied::Registered {
                    session_id: entry.index,
                    client_id: registration.client_id,
                    superseded,
                }
            }
            EntryKind::KeepAlive => Applied::KeptAlive {
                session_id: entry.session_id,
                result: self.sessions.keep_alive(entry.session_id, entry.sequence, now.0),
            },
            EntryKind::Unregister => {
                let result = self.sessions.close(entry.session_id);
                if result.is_ok() {
                    self.machine.session_closed(entry.session_id);
                }
                Applied::Closed {
                    session_id: entry.session_id,
                    result,
                }
            }
            EntryKind::Expire => {
                // A session may already be gone if a close raced the expiry;
                // both nodes see the same race, so it is not an error.
                if self.sessions.expire(entry.session_id).is_ok() {
                    self.machine.session_closed(entry.session_id);
                    tracing::debug!(session_id = entry.session_id, "session expired");
                }
                Applied::Expired {
                    session_id: entry.session_id,
                }
            }
        };

        self.last_applied = entry.index;
        self.last_applied_term = entry.term;
        self.last_time = now;
        Ok(ApplyOutcome {
            index: entry.index,
            term: entry.term,
            applied,
        })
    }

    fn apply_command(&mut self, entry: &LogEntry, now: BlockTime) -> Result<Applied, ExecutorError> {
        let session_id = entry.session_id;
        let sequence = entry.sequence;

        let check = match self.sessions.check_sequence(session_id, sequence) {
            Ok(check) => check,
            Err(error) => {
                return Ok(Applied::CommandRejected {
                    session_id,
                    sequence,
                    error,
                })
            }
        };
        match check {
            SequenceCheck::Apply => {}
            SequenceCheck::Duplicate(cached) => {
                return Ok(Applied::Command {
                    session_id,
                    sequence,
                    result: cached.result,
                    duplicate: true,
                })
            }
            SequenceCheck::Stale => {
                return Ok(Applied::Command {
                    session_id,
                    sequence,
                    result: Err(OperationError::StaleSequence { session_id, sequence }),
                    duplicate: true,
                })
            }
        }

        let result = match bincode::deserialize::<Operation>(&entry.payload) {
            Ok(operation) => {
                let commit = Commit {
                    index: entry.index,
                    session_id,
                    sequence,
                    time: now,
                    operation: &operation,
                };
                let machine = &mut self.machine;
                let registry = &self.registry;
                match panic::catch_unwind(AssertUnwindSafe(|| registry.apply_command(machine, commit))) {
                    Ok(result) => result,
                    Err(payload) => {
                        self.status = ExecutorStatus::Halted;
                        let message = panic_message(payload.as_ref());
                        tracing::error!(
                            index = entry.index,
                            name = %operation.name,
                            %message,
                            "command handler panicked, executor halted"
                        );
                        return Err(ExecutorError::PoisonPill {
                            index: entry.index,
                            message,
                        });
                    }
                }
            }
            Err(e) => Err(OperationError::Decode {
                name: "operation".to_string(),
                reason: e.to_string(),
            }),
        };

        // The session was checked above and nothing in between can close it.
        if let Err(error) = self
            .sessions
            .record_result(session_id, sequence, entry.index, result.clone())
        {
            tracing::warn!(index = entry.index, session_id, sequence, %error, "result not cached");
        }
        Ok(Applied::Command {
            session_id,
            sequence,
            result,
            duplicate: false,
        })
    }
}
