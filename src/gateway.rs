//! PLC Gateway
//!
//! All register and coil traffic to the PLC goes through the [`PlcGateway`]
//! trait. The bridge loop is written against the trait so tests can drive it
//! with a scripted gateway; [`ModbusGateway`] is the production
//! implementation over a Modbus TCP session.
//!
//! The gateway never retries a failed call. A failure is reported once,
//! tagged with the operation that was attempted, and the retry/reconnect
//! policy lives entirely in the bridge loop.
//!
//! The plant's PLC splits its memory spaces across Modbus unit ids: word
//! memory (holding registers) answers on one unit, bit memory (coils) on
//! another. [`AddressMap`] carries both unit ids alongside the coil and
//! register layout, and the concrete gateway switches the session's slave
//! address per call.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::prelude::*;

use crate::codec::{InputFlags, OutputFlags, OutputFlags2, SensorFrame};

/// The PLC operation a [`GatewayError`] was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOp {
    Connect,
    WriteAnalog,
    WriteInputFlags,
    WriteOutputFlags,
    WriteOutputFlags2,
    ReadOverrideFlag,
    ReadActuatorCoils,
    Disconnect,
}

impl fmt::Display for GatewayOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayOp::Connect => "connect",
            GatewayOp::WriteAnalog => "write analog registers",
            GatewayOp::WriteInputFlags => "write input flag coils",
            GatewayOp::WriteOutputFlags => "write output flag coils",
            GatewayOp::WriteOutputFlags2 => "write output flag 2 coils",
            GatewayOp::ReadOverrideFlag => "read override coil",
            GatewayOp::ReadActuatorCoils => "read actuator coils",
            GatewayOp::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// A failed PLC call, tagged with the operation that was attempted.
#[derive(Error, Debug)]
#[error("PLC {operation} failed: {kind}")]
pub struct GatewayError {
    pub operation: GatewayOp,
    #[source]
    pub kind: GatewayErrorKind,
}

impl GatewayError {
    pub fn new(operation: GatewayOp, kind: impl Into<GatewayErrorKind>) -> Self {
        Self {
            operation,
            kind: kind.into(),
        }
    }
}

/// What went wrong underneath a PLC call.
#[derive(Error, Debug)]
pub enum GatewayErrorKind {
    /// The Modbus transport failed (connection reset, malformed response).
    #[error("transport error: {0}")]
    Transport(#[from] tokio_modbus::Error),

    /// The PLC answered with a Modbus exception code.
    #[error("device exception: {0:?}")]
    Exception(ExceptionCode),

    /// The socket could not be opened or closed.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// No response arrived within the configured call timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The PLC answered with fewer coils than the request asked for.
    #[error("short coil response: asked for {requested}, got {received}")]
    ShortResponse { requested: usize, received: usize },
}

/// Where the plant's data lives in PLC memory.
///
/// Defaults match the deployed WTP ladder program. All of this is
/// configuration; a re-wired PLC only needs a new `[plc.address_map]`
/// section, not a rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressMap {
    /// First holding register of the five analog channels.
    pub analog_base: u16,
    /// First coil of the eight input flags.
    pub input_flag_base: u16,
    /// First coil of the eight output flags.
    pub output_flag_base: u16,
    /// First coil of the six second-group output flags.
    pub output_flag2_base: u16,
    /// The operator's override toggle coil.
    pub override_coil: u16,
    /// First coil of the actuator image read back under override.
    pub actuator_base: u16,
    /// Width of the actuator image, 1 to 16 coils.
    pub actuator_count: u16,
    /// Modbus unit id answering for word (register) memory.
    pub register_unit: u8,
    /// Modbus unit id answering for bit (coil) memory.
    pub coil_unit: u8,
}

impl Default for AddressMap {
    fn default() -> Self {
        Self {
            analog_base: 0,
            input_flag_base: 0,
            output_flag_base: 8,
            output_flag2_base: 16,
            override_coil: 6,
            actuator_base: 8,
            actuator_count: 14,
            register_unit: 1,
            coil_unit: 2,
        }
    }
}

/// Register and coil operations the bridge performs against the PLC.
///
/// One method per plant operation plus session management. Implementations
/// must not retry internally; every call maps to at most one Modbus
/// request so the loop's failure accounting stays accurate.
#[async_trait]
pub trait PlcGateway: Send {
    /// Write the five analog channels to holding registers.
    async fn write_analog(&mut self, frame: &SensorFrame) -> Result<(), GatewayError>;

    /// Write the input flag group to its coil span.
    async fn write_input_flags(&mut self, flags: InputFlags) -> Result<(), GatewayError>;

    /// Write the first output flag group to its coil span.
    async fn write_output_flags(&mut self, flags: OutputFlags) -> Result<(), GatewayError>;

    /// Write the second output flag group to its coil span.
    async fn write_output_flags2(&mut self, flags: OutputFlags2) -> Result<(), GatewayError>;

    /// Read the operator's override toggle coil.
    async fn read_override_flag(&mut self) -> Result<bool, GatewayError>;

    /// Read the actuator coil image relayed to the microcontroller under
    /// override. The returned vector is `actuator_count` long; callers
    /// zero-pad it to sixteen before packing.
    async fn read_actuator_coils(&mut self) -> Result<Vec<bool>, GatewayError>;

    /// Tear down and re-establish the session. Called by the loop's
    /// reconnect policy, never spontaneously.
    async fn reconnect(&mut self) -> Result<(), GatewayError>;

    /// Close the session cleanly.
    async fn close(&mut self) -> Result<(), GatewayError>;
}

/// Production [`PlcGateway`] over a Modbus TCP session.
pub struct ModbusGateway {
    ctx: Context,
    addr: SocketAddr,
    map: AddressMap,
    call_timeout: Duration,
}

impl ModbusGateway {
    /// Establish the TCP session. Fails fast; the caller decides whether a
    /// connect failure is fatal (it is, at startup).
    pub async fn connect(
        addr: SocketAddr,
        map: AddressMap,
        call_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let ctx = tcp::connect(addr)
            .await
            .map_err(|e| GatewayError::new(GatewayOp::Connect, e))?;
        Ok(Self {
            ctx,
            addr,
            map,
            call_timeout,
        })
    }

    /// The address map this gateway was built with.
    pub fn address_map(&self) -> &AddressMap {
        &self.map
    }

    /// Flatten a timed, nested Modbus call result into one error type.
    fn settle<T>(
        &self,
        op: GatewayOp,
        outcome: Result<
            Result<Result<T, ExceptionCode>, tokio_modbus::Error>,
            tokio::time::error::Elapsed,
        >,
    ) -> Result<T, GatewayError> {
        match outcome {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(exception))) => Err(GatewayError {
                operation: op,
                kind: GatewayErrorKind::Exception(exception),
            }),
            Ok(Err(transport)) => Err(GatewayError::new(op, transport)),
            Err(_) => Err(GatewayError {
                operation: op,
                kind: GatewayErrorKind::Timeout(self.call_timeout),
            }),
        }
    }

    async fn write_coil_span(
        &mut self,
        op: GatewayOp,
        base: u16,
        coils: &[bool],
    ) -> Result<(), GatewayError> {
        self.ctx.set_slave(Slave(self.map.coil_unit));
        let outcome = tokio::time::timeout(
            self.call_timeout,
            self.ctx.write_multiple_coils(base, coils),
        )
        .await;
        self.settle(op, outcome)
    }
}

#[async_trait]
impl PlcGateway for ModbusGateway {
    async fn write_analog(&mut self, frame: &SensorFrame) -> Result<(), GatewayError> {
        self.ctx.set_slave(Slave(self.map.register_unit));
        let outcome = tokio::time::timeout(
            self.call_timeout,
            self.ctx
                .write_multiple_registers(self.map.analog_base, &frame.analog_registers()),
        )
        .await;
        self.settle(GatewayOp::WriteAnalog, outcome)
    }

    async fn write_input_flags(&mut self, flags: InputFlags) -> Result<(), GatewayError> {
        let base = self.map.input_flag_base;
        self.write_coil_span(GatewayOp::WriteInputFlags, base, &flags.as_coils())
            .await
    }

    async fn write_output_flags(&mut self, flags: OutputFlags) -> Result<(), GatewayError> {
        let base = self.map.output_flag_base;
        self.write_coil_span(GatewayOp::WriteOutputFlags, base, &flags.as_coils())
            .await
    }

    async fn write_output_flags2(&mut self, flags: OutputFlags2) -> Result<(), GatewayError> {
        let base = self.map.output_flag2_base;
        self.write_coil_span(GatewayOp::WriteOutputFlags2, base, &flags.as_coils())
            .await
    }

    async fn read_override_flag(&mut self) -> Result<bool, GatewayError> {
        self.ctx.set_slave(Slave(self.map.coil_unit));
        let outcome = tokio::time::timeout(
            self.call_timeout,
            self.ctx.read_coils(self.map.override_coil, 1),
        )
        .await;
        let coils = self.settle(GatewayOp::ReadOverrideFlag, outcome)?;
        coils.first().copied().ok_or(GatewayError {
            operation: GatewayOp::ReadOverrideFlag,
            kind: GatewayErrorKind::ShortResponse {
                requested: 1,
                received: 0,
            },
        })
    }

    async fn read_actuator_coils(&mut self) -> Result<Vec<bool>, GatewayError> {
        self.ctx.set_slave(Slave(self.map.coil_unit));
        let outcome = tokio::time::timeout(
            self.call_timeout,
            self.ctx
                .read_coils(self.map.actuator_base, self.map.actuator_count),
        )
        .await;
        let coils = self.settle(GatewayOp::ReadActuatorCoils, outcome)?;
        let requested = usize::from(self.map.actuator_count);
        if coils.len() < requested {
            return Err(GatewayError {
                operation: GatewayOp::ReadActuatorCoils,
                kind: GatewayErrorKind::ShortResponse {
                    requested,
                    received: coils.len(),
                },
            });
        }
        Ok(coils)
    }

    async fn reconnect(&mut self) -> Result<(), GatewayError> {
        // Best effort on the old session; it is usually already dead.
        let _ = self.ctx.disconnect().await;
        self.ctx = tcp::connect(self.addr)
            .await
            .map_err(|e| GatewayError::new(GatewayOp::Connect, e))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.ctx
            .disconnect()
            .await
            .map_err(|e| GatewayError::new(GatewayOp::Disconnect, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_matches_plant_wiring() {
        let map = AddressMap::default();
        assert_eq!(map.analog_base, 0);
        assert_eq!(map.input_flag_base, 0);
        assert_eq!(map.output_flag_base, 8);
        assert_eq!(map.output_flag2_base, 16);
        assert_eq!(map.override_coil, 6);
        assert_eq!(map.actuator_base, 8);
        assert_eq!(map.actuator_count, 14);
        assert_eq!(map.register_unit, 1);
        assert_eq!(map.coil_unit, 2);
    }

    #[test]
    fn partial_map_toml_fills_in_defaults() {
        let map: AddressMap = toml::from_str("override_coil = 9\ncoil_unit = 3\n")
            .expect("valid partial map");
        assert_eq!(map.override_coil, 9);
        assert_eq!(map.coil_unit, 3);
        assert_eq!(map.actuator_count, 14);
        assert_eq!(map.register_unit, 1);
    }

    #[test]
    fn gateway_error_names_the_operation() {
        let err = GatewayError {
            operation: GatewayOp::WriteAnalog,
            kind: GatewayErrorKind::Timeout(Duration::from_secs(1)),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("write analog registers"), "{rendered}");
    }
}
