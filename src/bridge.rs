//! Bridge Loop
//!
//! One sequential control flow ties the plant together: read a frame from
//! the microcontroller, decode it, mirror it into PLC memory, ask the
//! arbiter who holds actuator authority, reply (ack or actuator relay),
//! persist the cycle. The [`Bridge`] value exclusively owns the serial
//! link and the PLC gateway for its whole lifetime, so no locking exists
//! anywhere in the cycle.
//!
//! Failure handling is deliberately simple. Malformed frames are dropped
//! and the loop continues immediately. Connection-level failures (serial
//! or Modbus) abort the cycle with no reply, sleep a fixed backoff and
//! count up; at a configured threshold the gateway is asked to reconnect.
//! The gateway itself never retries, so the whole policy lives here.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::arbiter::{self, OverrideState};
use crate::codec::{self, OutputFlags, OutputFlags2, SensorFrame, FRAME_LEN, OVERRIDE_COIL_COUNT};
use crate::error::BridgeError;
use crate::gateway::PlcGateway;
use crate::persist::{PersistenceSink, SensorRecord};

/// Loop timing and failure policy, normally taken from
/// [`PolicySettings`](crate::config::PolicySettings) plus the serial read
/// timeout.
#[derive(Debug, Clone, Copy)]
pub struct BridgePolicy {
    /// Bound on each serial read; also the idle cadence between shutdown
    /// checks while awaiting a frame.
    pub read_timeout: Duration,
    /// Sleep after a failed cycle before retrying.
    pub backoff: Duration,
    /// Consecutive failed cycles before a gateway reconnect. Zero
    /// disables reconnection.
    pub reconnect_after: u32,
}

impl Default for BridgePolicy {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            backoff: Duration::from_secs(1),
            reconnect_after: 5,
        }
    }
}

/// The bridge engine: owns both connections and runs cycles until the
/// shutdown flag flips.
pub struct Bridge<S, G> {
    serial: S,
    gateway: G,
    sink: Box<dyn PersistenceSink>,
    policy: BridgePolicy,
    shutdown: watch::Receiver<bool>,
}

impl<S, G> Bridge<S, G>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    G: PlcGateway,
{
    pub fn new(
        serial: S,
        gateway: G,
        sink: Box<dyn PersistenceSink>,
        policy: BridgePolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            serial,
            gateway,
            sink,
            policy,
            shutdown,
        }
    }

    /// Run cycles until shutdown. The gateway session is closed on every
    /// exit path; close failures are logged, not propagated.
    pub async fn run(mut self) -> crate::error::Result<()> {
        let outcome = self.run_inner().await;
        if let Err(e) = self.gateway.close().await {
            warn!(error = %e, "PLC session did not close cleanly");
        }
        info!("bridge stopped");
        outcome
    }

    async fn run_inner(&mut self) -> crate::error::Result<()> {
        let mut consecutive_failures: u32 = 0;

        loop {
            // Await: block for a full frame, observing shutdown each tick.
            let bytes = match self.await_frame().await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    info!("shutdown requested, leaving bridge loop");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "serial read failed");
                    consecutive_failures += 1;
                    self.back_off(&mut consecutive_failures).await;
                    continue;
                }
            };

            // Decode: a bad frame is dropped on the spot. The consumed
            // bytes are gone; there is no resynchronization scan, so a
            // misaligned stream stays misaligned until the sender pauses.
            let frame = match codec::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame");
                    continue;
                }
            };
            debug!(
                level1 = frame.level1,
                level2 = frame.level2,
                tds = frame.tds,
                flow = frame.flow,
                pressure = frame.pressure,
                input = frame.input.pack(),
                output = frame.output.pack(),
                output2 = frame.output2.pack(),
                "frame decoded"
            );

            match self.run_cycle(&frame).await {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    error!(error = %e, "cycle failed, backing off");
                    if e.is_connection_failure() {
                        consecutive_failures += 1;
                    }
                    self.back_off(&mut consecutive_failures).await;
                }
            }
        }
    }

    /// Accumulate exactly one frame's worth of bytes. Returns `None` when
    /// the shutdown flag flips while waiting. Each read is bounded by the
    /// configured timeout; an expired timeout just loops back, which is
    /// what keeps idle waiting from busy-spinning.
    async fn await_frame(&mut self) -> Result<Option<[u8; FRAME_LEN]>, std::io::Error> {
        let mut buf = [0u8; FRAME_LEN];
        let mut filled = 0;

        while filled < FRAME_LEN {
            if *self.shutdown.borrow() {
                return Ok(None);
            }
            match tokio::time::timeout(self.policy.read_timeout, self.serial.read(&mut buf[filled..]))
                .await
            {
                Ok(Ok(0)) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "serial link closed",
                    ))
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e),
                Err(_) => continue,
            }
        }

        Ok(Some(buf))
    }

    /// Sync-out, Reply and Persist for one decoded frame.
    ///
    /// The override state is queried exactly once and its value drives
    /// both the flag-write gate and the reply branch, so a cycle is
    /// internally consistent even if the operator toggles mid-cycle.
    async fn run_cycle(&mut self, frame: &SensorFrame) -> Result<(), BridgeError> {
        self.gateway.write_analog(frame).await?;

        let authority = arbiter::query(&mut self.gateway).await?;

        let (applied_output, applied_output2) = match authority {
            OverrideState::Normal => {
                self.gateway.write_input_flags(frame.input).await?;
                self.gateway.write_output_flags(frame.output).await?;
                self.gateway.write_output_flags2(frame.output2).await?;

                self.serial.write_all(&codec::encode_ack()).await?;
                self.serial.flush().await?;
                debug!("frame acknowledged");
                (frame.output, frame.output2)
            }
            OverrideState::Override => {
                // The PLC is authoritative: leave the flag coils alone and
                // relay its actuator image back to the microcontroller.
                let coils = self.gateway.read_actuator_coils().await?;
                let mut padded = [false; OVERRIDE_COIL_COUNT];
                for (slot, coil) in padded.iter_mut().zip(&coils) {
                    *slot = *coil;
                }
                let reply = codec::encode_override(&padded)?;

                self.serial.write_all(&reply).await?;
                self.serial.flush().await?;
                info!(
                    flag_one = reply[1],
                    flag_two = reply[2],
                    "override active, relayed PLC actuator image"
                );
                (OutputFlags::unpack(reply[1]), OutputFlags2::unpack(reply[2]))
            }
        };

        let record = SensorRecord::new(
            chrono::Utc::now(),
            frame,
            applied_output,
            applied_output2,
            authority,
        );
        if let Err(e) = self.sink.append(&record).await {
            error!(error = %e, "persistence append failed");
        }

        Ok(())
    }

    /// Fixed backoff plus the reconnect threshold. The counter resets
    /// after a reconnect attempt whether or not it succeeded, so a dead
    /// PLC is re-dialed every `reconnect_after` cycles instead of every
    /// cycle.
    async fn back_off(&mut self, consecutive_failures: &mut u32) {
        if self.policy.reconnect_after > 0 && *consecutive_failures >= self.policy.reconnect_after {
            info!(
                failures = *consecutive_failures,
                "reconnecting to PLC after repeated failures"
            );
            match self.gateway.reconnect().await {
                Ok(()) => info!("PLC session re-established"),
                Err(e) => error!(error = %e, "PLC reconnect failed"),
            }
            *consecutive_failures = 0;
        }
        tokio::time::sleep(self.policy.backoff).await;
    }
}
