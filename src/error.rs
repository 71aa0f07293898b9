//! Crate-wide error types.

use thiserror::Error;

use crate::bus::MemoryError;
use crate::{PeripheralId, StreamPoint};

/// Errors surfaced by the public device API.
///
/// Guest-visible fault conditions (translation faults, command errors, queue
/// overflow) are not Rust errors: they are reported through events and
/// registers the way the hardware reports them. This enum covers host-side
/// misuse of the model.
#[derive(Debug, Error)]
pub enum SmmuError {
    #[error("{point} is already registered")]
    StreamAlreadyRegistered { point: StreamPoint },

    #[error("{0} is already registered under another stream")]
    PeripheralAlreadyRegistered(PeripheralId),

    #[error("{0} has no registered stream")]
    UnknownPeripheral(PeripheralId),

    #[error("{0} is not backed by an external MMU")]
    NotAnExternalMmuStream(PeripheralId),

    #[error("{0} is not a bus-controlled stream")]
    NotABusStream(PeripheralId),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Convenience alias used throughout the crate.
pub type SmmuResult<T> = Result<T, SmmuError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SecurityState;

    #[test]
    fn error_display() {
        let err = SmmuError::UnknownPeripheral(PeripheralId(0x10));
        assert_eq!(err.to_string(), "peripheral 0x10 has no registered stream");

        let err = SmmuError::StreamAlreadyRegistered {
            point: StreamPoint {
                stream_id: 1,
                security_state: SecurityState::NonSecure,
            },
        };
        assert!(err.to_string().contains("stream #1"));
    }
}
