//! Bridge error types.
//!
//! Each failure class gets its own typed error at the component that
//! produces it (`DecodeError`, `GatewayError`, `PersistError`);
//! [`BridgeError`] aggregates them for callers that span components,
//! chiefly the bridge loop. The binary boundary wraps startup failures in
//! `anyhow` for context; the library never does.

use thiserror::Error;

use crate::codec::{DecodeError, EncodeError};
use crate::gateway::GatewayError;
use crate::persist::PersistError;

/// Convenience alias for results using the bridge error type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Any failure the bridge loop can encounter mid-cycle.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("frame rejected: {0}")]
    Decode(#[from] DecodeError),

    #[error("reply rejected: {0}")]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("serial I/O error: {0}")]
    Serial(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether this failure should feed the loop's backoff/reconnect
    /// accounting. Framing errors are a property of one frame, not of the
    /// connections, and persistence failures never abort a cycle.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, BridgeError::Gateway(_) | BridgeError::Serial(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayErrorKind, GatewayOp};
    use std::time::Duration;

    #[test]
    fn framing_errors_are_not_connection_failures() {
        let err = BridgeError::from(DecodeError::BadStartByte { actual: 0x55 });
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn gateway_and_serial_errors_are_connection_failures() {
        let gateway = BridgeError::from(GatewayError {
            operation: GatewayOp::WriteAnalog,
            kind: GatewayErrorKind::Timeout(Duration::from_secs(1)),
        });
        assert!(gateway.is_connection_failure());

        let serial = BridgeError::from(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "link dropped",
        ));
        assert!(serial.is_connection_failure());
    }
}
