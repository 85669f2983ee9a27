pub mod checker;
pub mod cluster;
pub mod nemesis;

#[cfg(test)]
mod tests;

pub use checker::{
    CheckResult, CheckStats, ClusterChecker, History, HistoryEntry, Outcome, Violation, ViolationKind,
};
pub use cluster::{SimCluster, TICK};
pub use nemesis::{Fault, FaultEvent, Nemesis, NemesisConfig};
