//! Local content store quota rules and the reservation/eviction protocol (§4.4).

pub mod eviction;
pub mod reservation;
pub mod rule;

pub use eviction::{ContentLister, EvictionCandidate, ReplicaExistenceChecker};
pub use reservation::{QuotaKeeper, Transaction};
pub use rule::{Calibratable, DiskFreePercentRule, ElasticSizeRule, MaxSizeRule, QuotaRule};
