use ulid::Ulid;

use crate::model::{LimitKind, LimitUnit};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A limit set whose caps decrease as the period widens. The whole
    /// write is rejected; nothing is partially applied.
    NotAscending(LimitKind),
    InvalidCap {
        kind: LimitKind,
        unit: LimitUnit,
    },
    /// Recording the booking would exceed a configured cap.
    QuotaExceeded {
        kind: LimitKind,
        unit: LimitUnit,
        cap: u32,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NotAscending(kind) => {
                write!(f, "{} limits must be in ascending order", kind.noun())
            }
            EngineError::InvalidCap { kind, unit } => {
                write!(
                    f,
                    "{} limit per {} must be a positive integer",
                    kind.noun(),
                    unit.label().to_lowercase()
                )
            }
            EngineError::QuotaExceeded { kind, unit, cap } => match kind {
                LimitKind::Bookings => {
                    write!(f, "booking limit reached: {cap} per {}", unit.label().to_lowercase())
                }
                LimitKind::Minutes => {
                    write!(
                        f,
                        "duration limit reached: {cap} minutes per {}",
                        unit.label().to_lowercase()
                    )
                }
            },
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
