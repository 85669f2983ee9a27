//! Executor tests.

use super::*;
use crate::engine::{EntryKind, LogEntry};
use crate::kernel::kv::{Crash, Echo, EchoQuery, Get, Increment, KvStore, Put};
use crate::kernel::session::{Registration, SessionError};
use crate::kernel::traits::{decode_output, CommandOp};

const SECOND: u64 = 1_000_000_000;

/// Builds a contiguous log the way a leader would.
struct LogBuilder {
    next: u64,
}

impl LogBuilder {
    fn new() -> Self {
        LogBuilder { next: 1 }
    }

    fn entry(&mut self, kind: EntryKind, session_id: u64, sequence: u64, ts: u64, payload: Vec<u8>) -> LogEntry {
        let index = self.next;
        self.next += 1;
        LogEntry {
            index,
            term: 1,
            kind,
            session_id,
            sequence,
            timestamp_ns: ts,
            payload,
        }
    }

    fn register(&mut self, client_id: u64, ts: u64) -> LogEntry {
        let payload = bincode::serialize(&Registration {
            client_id,
            timeout_ns: 5 * SECOND,
        })
        .unwrap();
        self.entry(EntryKind::Register, 0, 0, ts, payload)
    }

    fn command<C: CommandOp>(&mut self, session: u64, seq: u64, op: &C) -> LogEntry {
        let payload = bincode::serialize(&Operation::command(op).unwrap()).unwrap();
        self.entry(EntryKind::Command, session, seq, 0, payload)
    }
}

fn executor() -> Executor<KvStore> {
    Executor::new(KvStore::new(), vec![1, 2, 3])
}

fn output<T: serde::de::DeserializeOwned>(outcome: &ApplyOutcome) -> T {
    match &outcome.applied {
        Applied::Command { result: Ok(bytes), .. } => decode_output(bytes).unwrap(),
        other => panic!("expected successful command, got {:?}", other),
    }
}

#[test]
fn test_commands_apply_in_order_with_outputs() {
    let mut exec = executor();
    let mut log = LogBuilder::new();

    let reg = log.register(100, 0);
    let outcome = exec.apply(&reg).unwrap();
    assert!(matches!(outcome.applied, Applied::Registered { session_id: 1, client_id: 100, superseded: None }));

    let echo = log.command(1, 1, &Echo("Hello world!".into()));
    let outcome = exec.apply(&echo).unwrap();
    assert_eq!(output::<String>(&outcome), "Hello world!");

    let put = log.command(1, 2, &Put { key: "k".into(), value: "v".into() });
    exec.apply(&put).unwrap();
    assert_eq!(exec.machine().value("k"), Some("v"));
    assert_eq!(exec.last_applied(), 3);
}

#[test]
fn test_out_of_order_is_fatal_and_does_not_advance() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    let _skipped = log.entry(EntryKind::NoOp, 0, 0, 0, Vec::new());
    let second = log.entry(EntryKind::NoOp, 0, 0, 0, Vec::new());

    match exec.apply(&second) {
        Err(ExecutorError::OutOfOrder { expected: 1, found: 2 }) => {}
        other => panic!("expected out-of-order, got {:?}", other),
    }
    assert_eq!(exec.last_applied(), 0);
}

#[test]
fn test_duplicate_sequence_is_applied_once() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    exec.apply(&log.register(100, 0)).unwrap();

    let first = log.command(1, 1, &Increment { key: "n".into(), by: 5 });
    let retry = log.command(1, 1, &Increment { key: "n".into(), by: 5 });

    let a = exec.apply(&first).unwrap();
    let b = exec.apply(&retry).unwrap();
    assert_eq!(output::<u64>(&a), 5);
    assert_eq!(output::<u64>(&b), 5);
    assert!(matches!(b.applied, Applied::Command { duplicate: true, .. }));
    assert_eq!(exec.machine().counter("n"), 5);
}

#[test]
fn test_stale_sequence_after_acknowledgement() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    exec.apply(&log.register(100, 0)).unwrap();
    exec.apply(&log.command(1, 1, &Increment { key: "n".into(), by: 1 })).unwrap();

    let ka = log.entry(EntryKind::KeepAlive, 1, 1, SECOND, Vec::new());
    let outcome = exec.apply(&ka).unwrap();
    assert!(matches!(outcome.applied, Applied::KeptAlive { session_id: 1, result: Ok(()) }));

    let replay = log.command(1, 1, &Increment { key: "n".into(), by: 1 });
    match exec.apply(&replay).unwrap().applied {
        Applied::Command { result: Err(OperationError::StaleSequence { session_id: 1, sequence: 1 }), .. } => {}
        other => panic!("expected stale sequence, got {:?}", other),
    }
    assert_eq!(exec.machine().counter("n"), 1);
}

#[test]
fn test_commands_on_dead_sessions_are_rejected() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    exec.apply(&log.register(100, 0)).unwrap();
    exec.apply(&log.register(200, 0)).unwrap();

    let expire = log.entry(EntryKind::Expire, 1, 0, 10 * SECOND, Vec::new());
    exec.apply(&expire).unwrap();
    let close = log.entry(EntryKind::Unregister, 2, 0, 10 * SECOND, Vec::new());
    assert!(matches!(exec.apply(&close).unwrap().applied, Applied::Closed { result: Ok(()), .. }));

    let cmds = [
        (log.command(1, 1, &Echo("x".into())), SessionError::Expired(1)),
        (log.command(2, 1, &Echo("x".into())), SessionError::Closed(2)),
        (log.command(77, 1, &Echo("x".into())), SessionError::Unknown(77)),
    ];
    for (entry, expected) in cmds {
        match exec.apply(&entry).unwrap().applied {
            Applied::CommandRejected { error, .. } => assert_eq!(error, expected),
            other => panic!("expected rejection, got {:?}", other),
        }
    }
    assert_eq!(exec.machine().closed_sessions(), &[1, 2]);
    assert!(exec.sessions().is_empty());
}

#[test]
fn test_reregistration_supersedes_and_notifies_machine() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    exec.apply(&log.register(100, 0)).unwrap();
    let outcome = exec.apply(&log.register(100, SECOND)).unwrap();
    assert!(matches!(outcome.applied, Applied::Registered { session_id: 2, superseded: Some(1), .. }));
    assert_eq!(exec.machine().closed_sessions(), &[1]);
    assert_eq!(exec.sessions().session_for_client(100), Some(2));
}

#[test]
fn test_unknown_and_garbage_operations_are_deterministic_errors() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    exec.apply(&log.register(100, 0)).unwrap();

    let unknown = Operation {
        name: "nope".into(),
        data: Vec::new(),
    };
    let entry = log.entry(EntryKind::Command, 1, 1, 0, bincode::serialize(&unknown).unwrap());
    assert!(matches!(
        exec.apply(&entry).unwrap().applied,
        Applied::Command { result: Err(OperationError::UnknownOperation { .. }), duplicate: false, .. }
    ));

    let garbage = log.entry(EntryKind::Command, 1, 2, 0, vec![0xFF; 3]);
    assert!(matches!(
        exec.apply(&garbage).unwrap().applied,
        Applied::Command { result: Err(OperationError::Decode { .. }), .. }
    ));
    assert_eq!(exec.last_applied(), 3);
}

#[test]
fn test_poison_pill_halts_executor() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    exec.apply(&log.register(100, 0)).unwrap();
    exec.apply(&log.command(1, 1, &Increment { key: "n".into(), by: 50 })).unwrap();

    let poison = log.command(1, 2, &Crash);
    match exec.apply(&poison) {
        Err(ExecutorError::PoisonPill { index: 3, message }) => assert!(message.contains("crash requested")),
        other => panic!("expected poison pill, got {:?}", other),
    }
    assert!(exec.is_halted());
    assert_eq!(exec.last_applied(), 2);

    // Nothing after the poisoned entry is ever applied.
    let after = log.command(1, 3, &Increment { key: "n".into(), by: 10 });
    assert!(matches!(exec.apply(&after), Err(ExecutorError::Halted)));
    assert_eq!(exec.machine().counter("n"), 50);
    assert!(matches!(exec.snapshot(), Err(ExecutorError::Halted)));
}

#[test]
fn test_configuration_replaces_members() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    let entry = log.entry(EntryKind::Configuration, 0, 0, 0, bincode::serialize(&vec![1u32, 2, 3, 4]).unwrap());
    let outcome = exec.apply(&entry).unwrap();
    assert_eq!(outcome.applied, Applied::Configuration { members: vec![1, 2, 3, 4] });
    assert_eq!(exec.members(), &[1, 2, 3, 4]);

    let bad = log.entry(EntryKind::Configuration, 0, 0, 0, vec![1]);
    assert!(matches!(exec.apply(&bad), Err(ExecutorError::MalformedEntry { index: 2, .. })));
}

#[test]
fn test_log_time_never_moves_backwards() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    exec.apply(&log.entry(EntryKind::NoOp, 0, 0, 5 * SECOND, Vec::new())).unwrap();
    exec.apply(&log.entry(EntryKind::NoOp, 0, 0, 2 * SECOND, Vec::new())).unwrap();
    assert_eq!(exec.last_time().as_nanos(), 5 * SECOND);
}

#[test]
fn test_query_reads_current_state() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    exec.apply(&log.register(100, 0)).unwrap();
    exec.apply(&log.command(1, 1, &Put { key: "k".into(), value: "v".into() })).unwrap();

    let get = Operation::query(&Get { key: "k".into() }).unwrap();
    let out = exec.query(1, 1, &get).unwrap();
    assert_eq!(decode_output::<Option<String>>(&out).unwrap(), Some("v".to_string()));

    let echo = Operation::query(&EchoQuery("Hello world!".into())).unwrap();
    assert_eq!(decode_output::<String>(&exec.query(1, 1, &echo).unwrap()).unwrap(), "Hello world!");
}

#[test]
fn test_snapshot_restore_resumes_exactly() {
    let mut exec = executor();
    let mut log = LogBuilder::new();
    exec.apply(&log.register(100, 0)).unwrap();
    exec.apply(&log.command(1, 1, &Increment { key: "n".into(), by: 7 })).unwrap();

    let file = exec.snapshot().unwrap();
    assert_eq!(file.last_included_index, 2);

    let mut fresh = Executor::new(KvStore::new(), vec![9]);
    fresh.restore(&file).unwrap();
    assert_eq!(fresh.last_applied(), 2);
    assert_eq!(fresh.members(), &[1, 2, 3]);
    assert_eq!(fresh.machine().counter("n"), 7);

    // The dedup table survives, so a retransmitted command is not re-run.
    let retry = log.command(1, 1, &Increment { key: "n".into(), by: 7 });
    let outcome = fresh.apply(&retry).unwrap();
    assert!(matches!(outcome.applied, Applied::Command { duplicate: true, .. }));
    assert_eq!(fresh.machine().counter("n"), 7);
}

#[test]
fn test_restore_rejects_mismatched_header() {
    let exec = executor();
    let mut file = exec.snapshot().unwrap();
    file.last_included_index = 40;

    let mut other = executor();
    assert!(matches!(other.restore(&file), Err(ExecutorError::Restore(_))));
    assert_eq!(other.last_applied(), 0);
}
