//! Override Arbitration
//!
//! One coil on the PLC decides who commands the plant's actuators: the
//! microcontroller's local logic, or the operator at the PLC panel. The
//! arbiter reads that coil and nothing else — no debounce, no hysteresis,
//! no caching. Whatever the coil says at query time is the answer.
//!
//! The bridge loop queries the arbiter exactly once per cycle and threads
//! the result through both decisions that depend on it (whether to push
//! flag coils, and which reply to send). Querying twice would let the coil
//! flip between reads and produce a cycle that half-obeys each side.

use std::fmt;

use crate::gateway::{GatewayError, PlcGateway};

/// Who holds actuator authority for the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideState {
    /// The microcontroller's local logic commands the actuators.
    Normal,
    /// The PLC operator commands the actuators; the microcontroller's
    /// reported flags are informational only.
    Override,
}

impl OverrideState {
    /// Interpret the raw override coil.
    pub fn from_coil(coil: bool) -> Self {
        if coil {
            OverrideState::Override
        } else {
            OverrideState::Normal
        }
    }

    pub fn is_override(self) -> bool {
        matches!(self, OverrideState::Override)
    }
}

impl fmt::Display for OverrideState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideState::Normal => f.write_str("normal"),
            OverrideState::Override => f.write_str("override"),
        }
    }
}

/// Read the override coil once and report who is in charge.
///
/// Pure query: one Modbus coil read, no side effects, no memoization.
pub async fn query<G: PlcGateway + ?Sized>(gateway: &mut G) -> Result<OverrideState, GatewayError> {
    Ok(OverrideState::from_coil(gateway.read_override_flag().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coil_maps_onto_authority() {
        assert_eq!(OverrideState::from_coil(false), OverrideState::Normal);
        assert_eq!(OverrideState::from_coil(true), OverrideState::Override);
        assert!(OverrideState::Override.is_override());
        assert!(!OverrideState::Normal.is_override());
    }

    #[test]
    fn renders_for_logs() {
        assert_eq!(OverrideState::Normal.to_string(), "normal");
        assert_eq!(OverrideState::Override.to_string(), "override");
    }
}
