use thiserror::Error;

/// Typed error kinds a caller is expected to match on, per §7. Everything
/// else (malformed paths, I/O failures) is propagated as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("quota exceeded: requested {requested} bytes, {diagnostic}")]
    QuotaExceeded { requested: i64, diagnostic: String },
    #[error("reservation canceled")]
    Canceled,
}

#[derive(Debug, Error)]
pub enum CldbError {
    #[error("database invalidated: {0}")]
    DatabaseInvalidated(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Outcome of one copy attempt against one replica, per §4.5 / §7.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum CopyErrorKind {
    FileNotFound,
    SourcePathError,
    DestinationPathError,
    CopyTimeout,
    BandwidthTimeout,
    InvalidHash,
    Unknown,
}

impl CopyErrorKind {
    /// Non-retryable kinds short-circuit the walk for the whole call,
    /// per §4.5 step 2: "for the non-retryable set (DestinationPathError),
    /// short-circuit with retry=false".
    pub fn is_retryable(self) -> bool {
        !matches!(self, CopyErrorKind::DestinationPathError)
    }
}

/// Per-replica recent-outcome label used by the copier to bias replica
/// choice.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum Reputation {
    Good,
    Bad,
    Missing,
    Timeout,
}

impl From<CopyErrorKind> for Reputation {
    fn from(kind: CopyErrorKind) -> Self {
        match kind {
            CopyErrorKind::FileNotFound => Reputation::Missing,
            CopyErrorKind::SourcePathError => Reputation::Bad,
            CopyErrorKind::DestinationPathError => Reputation::Bad,
            CopyErrorKind::CopyTimeout | CopyErrorKind::BandwidthTimeout => Reputation::Timeout,
            CopyErrorKind::InvalidHash => Reputation::Bad,
            CopyErrorKind::Unknown => Reputation::Bad,
        }
    }
}
