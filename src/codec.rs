//! WTP Serial Frame Codec
//!
//! The microcontroller in the field cabinet reports plant state as a
//! fixed-length 10-byte binary frame, and expects either a one-byte
//! acknowledgement or a three-byte actuator-override packet in return.
//!
//! Frame layout (inbound, microcontroller → bridge):
//!
//! | Byte | Meaning                          |
//! |------|----------------------------------|
//! | 0    | Start byte, always `0xAA`        |
//! | 1    | Tank level 1 (raw ADC scale)     |
//! | 2    | Tank level 2                     |
//! | 3    | TDS                              |
//! | 4    | Flow                             |
//! | 5    | Pressure                         |
//! | 6    | Input flags (switches, modes)    |
//! | 7    | Output flags (solenoids, pumps)  |
//! | 8    | Output flags 2 (lamps, stepper)  |
//! | 9    | XOR checksum over bytes 0..9     |
//!
//! Bit order inside every flag byte is LSB-first: bit 0 of byte 6 is the
//! first input flag. The top two bits of byte 8 are reserved and carry no
//! meaning; they are discarded on decode and written as zero on encode.
//!
//! Replies (bridge → microcontroller):
//! - `0xFF` alone acknowledges a frame processed under local control.
//! - `[0xBB, flag_one, flag_two]` relays the PLC's actuator image back to
//!   the microcontroller when the operator override is active.

use thiserror::Error;

/// First byte of every valid inbound frame.
pub const START_BYTE: u8 = 0xAA;

/// Total length of an inbound frame, checksum included.
pub const FRAME_LEN: usize = 10;

/// Single-byte acknowledgement sent after a normally processed frame.
pub const ACK_BYTE: u8 = 0xFF;

/// First byte of the three-byte override reply.
pub const OVERRIDE_START_BYTE: u8 = 0xBB;

/// Number of coil values carried by an override reply (two packed bytes).
pub const OVERRIDE_COIL_COUNT: usize = 16;

/// Reasons an inbound byte sequence is rejected as a frame.
///
/// All of these are local to a single frame. The caller drops the bytes,
/// logs the reason and waits for the next frame; none of them indicate a
/// broken link.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame must be {FRAME_LEN} bytes, got {actual}")]
    BadLength { actual: usize },

    #[error("frame must start with {START_BYTE:#04x}, got {actual:#04x}")]
    BadStartByte { actual: u8 },

    #[error("checksum mismatch: frame carries {expected:#04x}, computed {computed:#04x}")]
    ChecksumMismatch { expected: u8, computed: u8 },
}

/// Reasons a reply cannot be encoded.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("override reply packs exactly {OVERRIDE_COIL_COUNT} coils, got {actual}")]
    InvalidFlagCount { actual: usize },
}

/// XOR-fold of a byte slice.
///
/// This is the frame's integrity check. It detects corruption only; it is
/// not a cryptographic digest and offers no tamper resistance.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Discrete inputs reported by the microcontroller, one flag per bit of
/// frame byte 6 (LSB-first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputFlags {
    pub level_switch: bool,
    pub pb_start: bool,
    pub mode_standby: bool,
    pub mode_filtering: bool,
    pub mode_backwash: bool,
    pub mode_drain: bool,
    pub mode_override: bool,
    pub emergency_stop: bool,
}

impl InputFlags {
    /// Number of coils this group occupies on the PLC.
    pub const COIL_COUNT: usize = 8;

    /// Interpret a raw flag byte, bit 0 first.
    pub fn unpack(byte: u8) -> Self {
        Self {
            level_switch: byte & 0x01 != 0,
            pb_start: byte & 0x02 != 0,
            mode_standby: byte & 0x04 != 0,
            mode_filtering: byte & 0x08 != 0,
            mode_backwash: byte & 0x10 != 0,
            mode_drain: byte & 0x20 != 0,
            mode_override: byte & 0x40 != 0,
            emergency_stop: byte & 0x80 != 0,
        }
    }

    /// Repack into the wire byte. Inverse of [`InputFlags::unpack`].
    pub fn pack(&self) -> u8 {
        pack_bits(&self.as_coils())
    }

    /// Flags in wire order, ready to write as a PLC coil span.
    pub fn as_coils(&self) -> [bool; Self::COIL_COUNT] {
        [
            self.level_switch,
            self.pb_start,
            self.mode_standby,
            self.mode_filtering,
            self.mode_backwash,
            self.mode_drain,
            self.mode_override,
            self.emergency_stop,
        ]
    }
}

/// Actuator outputs reported by the microcontroller, one flag per bit of
/// frame byte 7 (LSB-first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputFlags {
    pub solenoid_1: bool,
    pub solenoid_2: bool,
    pub solenoid_3: bool,
    pub solenoid_4: bool,
    pub solenoid_5: bool,
    pub solenoid_6: bool,
    pub pump_1: bool,
    pub pump_2: bool,
}

impl OutputFlags {
    /// Number of coils this group occupies on the PLC.
    pub const COIL_COUNT: usize = 8;

    /// Interpret a raw flag byte, bit 0 first.
    pub fn unpack(byte: u8) -> Self {
        Self {
            solenoid_1: byte & 0x01 != 0,
            solenoid_2: byte & 0x02 != 0,
            solenoid_3: byte & 0x04 != 0,
            solenoid_4: byte & 0x08 != 0,
            solenoid_5: byte & 0x10 != 0,
            solenoid_6: byte & 0x20 != 0,
            pump_1: byte & 0x40 != 0,
            pump_2: byte & 0x80 != 0,
        }
    }

    /// Repack into the wire byte. Inverse of [`OutputFlags::unpack`].
    pub fn pack(&self) -> u8 {
        pack_bits(&self.as_coils())
    }

    /// Flags in wire order, ready to write as a PLC coil span.
    pub fn as_coils(&self) -> [bool; Self::COIL_COUNT] {
        [
            self.solenoid_1,
            self.solenoid_2,
            self.solenoid_3,
            self.solenoid_4,
            self.solenoid_5,
            self.solenoid_6,
            self.pump_1,
            self.pump_2,
        ]
    }
}

/// Second actuator group: the low six bits of frame byte 8.
///
/// Bits 6 and 7 of the source byte are reserved. `unpack` ignores them and
/// `pack` leaves them zero, so a frame carrying garbage in the reserved
/// bits still round-trips to a clean byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputFlags2 {
    pub pump_3: bool,
    pub standby_lamp: bool,
    pub filtering_lamp: bool,
    pub backwash_lamp: bool,
    pub drain_lamp: bool,
    pub stepper: bool,
}

impl OutputFlags2 {
    /// Number of coils this group occupies on the PLC.
    pub const COIL_COUNT: usize = 6;

    /// Interpret a raw flag byte, bit 0 first, reserved bits discarded.
    pub fn unpack(byte: u8) -> Self {
        Self {
            pump_3: byte & 0x01 != 0,
            standby_lamp: byte & 0x02 != 0,
            filtering_lamp: byte & 0x04 != 0,
            backwash_lamp: byte & 0x08 != 0,
            drain_lamp: byte & 0x10 != 0,
            stepper: byte & 0x20 != 0,
        }
    }

    /// Repack into the wire byte with the reserved bits zero.
    pub fn pack(&self) -> u8 {
        pack_bits(&self.as_coils())
    }

    /// Flags in wire order, ready to write as a PLC coil span.
    pub fn as_coils(&self) -> [bool; Self::COIL_COUNT] {
        [
            self.pump_3,
            self.standby_lamp,
            self.filtering_lamp,
            self.backwash_lamp,
            self.drain_lamp,
            self.stepper,
        ]
    }
}

/// Decoded payload of one inbound frame.
///
/// Produced by [`decode`] and consumed within a single bridge cycle. The
/// analog channels keep the microcontroller's raw 8-bit scale; any
/// engineering-unit conversion happens downstream of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorFrame {
    pub level1: u8,
    pub level2: u8,
    pub tds: u8,
    pub flow: u8,
    pub pressure: u8,
    pub input: InputFlags,
    pub output: OutputFlags,
    pub output2: OutputFlags2,
}

impl SensorFrame {
    /// Analog channels widened to register width, in holding-register
    /// order: level1, level2, tds, flow, pressure.
    pub fn analog_registers(&self) -> [u16; 5] {
        [
            u16::from(self.level1),
            u16::from(self.level2),
            u16::from(self.tds),
            u16::from(self.flow),
            u16::from(self.pressure),
        ]
    }
}

/// Validate and decode one inbound frame.
///
/// Checks length, start byte and checksum in that order, so a caller sees
/// the most specific failure first. The reserved bits of the second output
/// flag byte are accepted with any value.
pub fn decode(bytes: &[u8]) -> Result<SensorFrame, DecodeError> {
    if bytes.len() != FRAME_LEN {
        return Err(DecodeError::BadLength {
            actual: bytes.len(),
        });
    }
    if bytes[0] != START_BYTE {
        return Err(DecodeError::BadStartByte { actual: bytes[0] });
    }
    let computed = xor_checksum(&bytes[..FRAME_LEN - 1]);
    let expected = bytes[FRAME_LEN - 1];
    if computed != expected {
        return Err(DecodeError::ChecksumMismatch { expected, computed });
    }

    Ok(SensorFrame {
        level1: bytes[1],
        level2: bytes[2],
        tds: bytes[3],
        flow: bytes[4],
        pressure: bytes[5],
        input: InputFlags::unpack(bytes[6]),
        output: OutputFlags::unpack(bytes[7]),
        output2: OutputFlags2::unpack(bytes[8]),
    })
}

/// Build a valid inbound frame, checksum included.
///
/// This is the microcontroller's side of the wire. The bridge itself never
/// sends frames; the encoder exists for diagnostics and for tests that
/// play the microcontroller role over a duplex stream.
pub fn encode(frame: &SensorFrame) -> [u8; FRAME_LEN] {
    let mut bytes = [
        START_BYTE,
        frame.level1,
        frame.level2,
        frame.tds,
        frame.flow,
        frame.pressure,
        frame.input.pack(),
        frame.output.pack(),
        frame.output2.pack(),
        0,
    ];
    bytes[FRAME_LEN - 1] = xor_checksum(&bytes[..FRAME_LEN - 1]);
    bytes
}

/// The one-byte acknowledgement for a normally processed frame.
pub fn encode_ack() -> [u8; 1] {
    [ACK_BYTE]
}

/// Pack sixteen actuator coil values into the three-byte override reply.
///
/// Coil `i` lands in bit `i` of the first flag byte for `i < 8` and bit
/// `i - 8` of the second otherwise. Callers reading a shorter actuator
/// span from the PLC zero-pad it to sixteen before packing.
pub fn encode_override(coils: &[bool]) -> Result<[u8; 3], EncodeError> {
    if coils.len() != OVERRIDE_COIL_COUNT {
        return Err(EncodeError::InvalidFlagCount {
            actual: coils.len(),
        });
    }
    Ok([
        OVERRIDE_START_BYTE,
        pack_bits(&coils[..8]),
        pack_bits(&coils[8..]),
    ])
}

/// Fold up to eight flags into a byte, first flag in bit 0.
fn pack_bits(bits: &[bool]) -> u8 {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (i, &bit)| acc | (u8::from(bit) << i))
}
