//! End-to-end bridge cycle scenarios.
//!
//! These tests drive a real `Bridge` over an in-memory duplex stream
//! (playing the microcontroller) and a scripted gateway (playing the PLC),
//! covering the normal, override, corrupt-frame and gateway-failure
//! cycles plus the reconnect and shutdown policies.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::time::timeout;

use wtp_bridge::arbiter::OverrideState;
use wtp_bridge::bridge::{Bridge, BridgePolicy};
use wtp_bridge::codec::{self, InputFlags, OutputFlags, OutputFlags2, SensorFrame};
use wtp_bridge::gateway::{GatewayError, GatewayErrorKind, GatewayOp, PlcGateway};
use wtp_bridge::persist::{PersistError, PersistenceSink, SensorRecord};

/// Everything the scripted gateway saw, for post-run assertions.
#[derive(Default)]
struct GatewayLog {
    analog_writes: Vec<[u16; 5]>,
    input_flag_writes: Vec<u8>,
    output_flag_writes: Vec<u8>,
    output_flag2_writes: Vec<u8>,
    override_reads: u32,
    actuator_reads: u32,
    reconnects: u32,
    closed: bool,
}

/// Scripted PLC stand-in: a settable override coil, a fixed actuator
/// image and an optional budget of injected write failures.
#[derive(Clone)]
struct ScriptedGateway {
    log: Arc<Mutex<GatewayLog>>,
    override_coil: Arc<AtomicBool>,
    actuator_image: Vec<bool>,
    analog_failures_left: Arc<AtomicU32>,
}

impl ScriptedGateway {
    fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(GatewayLog::default())),
            override_coil: Arc::new(AtomicBool::new(false)),
            actuator_image: vec![false; 14],
            analog_failures_left: Arc::new(AtomicU32::new(0)),
        }
    }

    fn with_actuator_image(mut self, image: Vec<bool>) -> Self {
        self.actuator_image = image;
        self
    }

    fn fail_next_analog_writes(&self, count: u32) {
        self.analog_failures_left.store(count, Ordering::SeqCst);
    }

    fn set_override(&self, active: bool) {
        self.override_coil.store(active, Ordering::SeqCst);
    }

    fn injected_failure(op: GatewayOp) -> GatewayError {
        GatewayError {
            operation: op,
            kind: GatewayErrorKind::Timeout(Duration::from_millis(1)),
        }
    }
}

#[async_trait]
impl PlcGateway for ScriptedGateway {
    async fn write_analog(&mut self, frame: &SensorFrame) -> Result<(), GatewayError> {
        if self
            .analog_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Self::injected_failure(GatewayOp::WriteAnalog));
        }
        self.log
            .lock()
            .unwrap()
            .analog_writes
            .push(frame.analog_registers());
        Ok(())
    }

    async fn write_input_flags(&mut self, flags: InputFlags) -> Result<(), GatewayError> {
        self.log.lock().unwrap().input_flag_writes.push(flags.pack());
        Ok(())
    }

    async fn write_output_flags(&mut self, flags: OutputFlags) -> Result<(), GatewayError> {
        self.log
            .lock()
            .unwrap()
            .output_flag_writes
            .push(flags.pack());
        Ok(())
    }

    async fn write_output_flags2(&mut self, flags: OutputFlags2) -> Result<(), GatewayError> {
        self.log
            .lock()
            .unwrap()
            .output_flag2_writes
            .push(flags.pack());
        Ok(())
    }

    async fn read_override_flag(&mut self) -> Result<bool, GatewayError> {
        self.log.lock().unwrap().override_reads += 1;
        Ok(self.override_coil.load(Ordering::SeqCst))
    }

    async fn read_actuator_coils(&mut self) -> Result<Vec<bool>, GatewayError> {
        self.log.lock().unwrap().actuator_reads += 1;
        Ok(self.actuator_image.clone())
    }

    async fn reconnect(&mut self) -> Result<(), GatewayError> {
        self.log.lock().unwrap().reconnects += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Sink that records every appended row.
#[derive(Clone)]
struct RecordingSink(Arc<Mutex<Vec<SensorRecord>>>);

impl RecordingSink {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn records(&self) -> Vec<SensorRecord> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceSink for RecordingSink {
    async fn append(&mut self, record: &SensorRecord) -> Result<(), PersistError> {
        self.0.lock().unwrap().push(*record);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), PersistError> {
        Ok(())
    }
}

fn fast_policy() -> BridgePolicy {
    BridgePolicy {
        read_timeout: Duration::from_millis(20),
        backoff: Duration::from_millis(10),
        reconnect_after: 0,
    }
}

/// Spawn the bridge on its own task and hand back the microcontroller's
/// end of the wire.
fn start_bridge(
    gateway: ScriptedGateway,
    sink: RecordingSink,
    policy: BridgePolicy,
) -> (
    DuplexStream,
    watch::Sender<bool>,
    tokio::task::JoinHandle<wtp_bridge::error::Result<()>>,
) {
    let (micro, device) = tokio::io::duplex(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = Bridge::new(device, gateway, Box::new(sink), policy, shutdown_rx);
    let handle = tokio::spawn(bridge.run());
    (micro, shutdown_tx, handle)
}

/// Reference frame: level1=50, standby mode, solenoid 1 energized.
fn scenario_frame() -> [u8; 10] {
    let mut bytes = [0xAA, 50, 40, 10, 5, 2, 0b0000_0100, 0b0000_0001, 0, 0];
    bytes[9] = codec::xor_checksum(&bytes[..9]);
    bytes
}

async fn read_reply(micro: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_millis(500), micro.read_exact(&mut buf))
        .await
        .expect("no reply within deadline")
        .expect("serial read failed");
    buf
}

async fn assert_no_reply(micro: &mut DuplexStream) {
    let mut buf = [0u8; 1];
    let outcome = timeout(Duration::from_millis(100), micro.read_exact(&mut buf)).await;
    assert!(outcome.is_err(), "unexpected reply byte {:#04x}", buf[0]);
}

#[tokio::test]
async fn normal_cycle_mirrors_frame_and_acks() {
    let gateway = ScriptedGateway::new();
    let sink = RecordingSink::new();
    let log = Arc::clone(&gateway.log);
    let (mut micro, shutdown, handle) = start_bridge(gateway, sink.clone(), fast_policy());

    micro.write_all(&scenario_frame()).await.unwrap();
    let reply = read_reply(&mut micro, 1).await;
    assert_eq!(reply, [0xFF]);

    {
        let log = log.lock().unwrap();
        assert_eq!(log.analog_writes, vec![[50, 40, 10, 5, 2]]);
        assert_eq!(log.input_flag_writes, vec![0b0000_0100]);
        assert_eq!(log.output_flag_writes, vec![0b0000_0001]);
        assert_eq!(log.output_flag2_writes, vec![0]);
        assert_eq!(log.override_reads, 1, "override queried exactly once");
        assert_eq!(log.actuator_reads, 0);
    }

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].level1, 50);
    assert_eq!(records[0].authority, OverrideState::Normal);
    assert!(records[0].applied_output.solenoid_1);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn override_cycle_relays_plc_image_without_writing_flags() {
    let mut image = vec![false; 14];
    image[0] = true; // solenoid 1 per the PLC
    image[6] = true; // pump 1
    image[9] = true; // bit 1 of the second byte
    let gateway = ScriptedGateway::new().with_actuator_image(image);
    gateway.set_override(true);
    let sink = RecordingSink::new();
    let log = Arc::clone(&gateway.log);
    let (mut micro, shutdown, handle) = start_bridge(gateway, sink.clone(), fast_policy());

    micro.write_all(&scenario_frame()).await.unwrap();
    let reply = read_reply(&mut micro, 3).await;
    assert_eq!(reply, [0xBB, 0b0100_0001, 0b0000_0010]);

    {
        let log = log.lock().unwrap();
        // Analog channels still mirror; flag coils stay untouched.
        assert_eq!(log.analog_writes.len(), 1);
        assert!(log.input_flag_writes.is_empty());
        assert!(log.output_flag_writes.is_empty());
        assert!(log.output_flag2_writes.is_empty());
        assert_eq!(log.override_reads, 1, "override queried exactly once");
        assert_eq!(log.actuator_reads, 1);
    }

    // The record carries what the plant actually ran with: the PLC image.
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].authority, OverrideState::Override);
    assert!(records[0].applied_output.solenoid_1);
    assert!(records[0].applied_output.pump_1);
    assert!(records[0].applied_output2.standby_lamp);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn corrupt_frame_is_dropped_without_plc_traffic_or_reply() {
    let gateway = ScriptedGateway::new();
    let sink = RecordingSink::new();
    let log = Arc::clone(&gateway.log);
    let (mut micro, shutdown, handle) = start_bridge(gateway, sink.clone(), fast_policy());

    let mut bytes = scenario_frame();
    bytes[9] ^= 0xFF;
    micro.write_all(&bytes).await.unwrap();

    assert_no_reply(&mut micro).await;
    {
        let log = log.lock().unwrap();
        assert!(log.analog_writes.is_empty());
        assert_eq!(log.override_reads, 0);
    }
    assert!(sink.records().is_empty());

    // The loop is still alive: a good frame right after goes through.
    micro.write_all(&scenario_frame()).await.unwrap();
    assert_eq!(read_reply(&mut micro, 1).await, [0xFF]);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn gateway_failure_aborts_cycle_then_next_frame_proceeds() {
    let gateway = ScriptedGateway::new();
    gateway.fail_next_analog_writes(1);
    let sink = RecordingSink::new();
    let log = Arc::clone(&gateway.log);
    let (mut micro, shutdown, handle) = start_bridge(gateway, sink.clone(), fast_policy());

    micro.write_all(&scenario_frame()).await.unwrap();
    assert_no_reply(&mut micro).await;
    assert!(sink.records().is_empty(), "failed cycle must not persist");

    micro.write_all(&scenario_frame()).await.unwrap();
    assert_eq!(read_reply(&mut micro, 1).await, [0xFF]);
    assert_eq!(log.lock().unwrap().analog_writes.len(), 1);
    assert_eq!(sink.records().len(), 1);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn identical_frames_produce_identical_writes() {
    // No frame-sequence deduplication exists, by design.
    let gateway = ScriptedGateway::new();
    let sink = RecordingSink::new();
    let log = Arc::clone(&gateway.log);
    let (mut micro, shutdown, handle) = start_bridge(gateway, sink, fast_policy());

    for _ in 0..3 {
        micro.write_all(&scenario_frame()).await.unwrap();
        assert_eq!(read_reply(&mut micro, 1).await, [0xFF]);
    }

    {
        let log = log.lock().unwrap();
        assert_eq!(log.analog_writes, vec![[50, 40, 10, 5, 2]; 3]);
        assert_eq!(log.input_flag_writes, vec![0b0000_0100; 3]);
        assert_eq!(log.override_reads, 3);
    }

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn reconnects_after_threshold_of_consecutive_failures() {
    let gateway = ScriptedGateway::new();
    gateway.fail_next_analog_writes(2);
    let sink = RecordingSink::new();
    let log = Arc::clone(&gateway.log);
    let policy = BridgePolicy {
        reconnect_after: 2,
        ..fast_policy()
    };
    let (mut micro, shutdown, handle) = start_bridge(gateway, sink, policy);

    // Two failing frames reach the threshold; the third goes through.
    micro.write_all(&scenario_frame()).await.unwrap();
    assert_no_reply(&mut micro).await;
    micro.write_all(&scenario_frame()).await.unwrap();
    assert_no_reply(&mut micro).await;
    micro.write_all(&scenario_frame()).await.unwrap();
    assert_eq!(read_reply(&mut micro, 1).await, [0xFF]);

    assert_eq!(log.lock().unwrap().reconnects, 1);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn baseline_policy_never_reconnects() {
    let gateway = ScriptedGateway::new();
    gateway.fail_next_analog_writes(4);
    let sink = RecordingSink::new();
    let log = Arc::clone(&gateway.log);
    let (mut micro, shutdown, handle) = start_bridge(gateway, sink, fast_policy());

    for _ in 0..4 {
        micro.write_all(&scenario_frame()).await.unwrap();
        assert_no_reply(&mut micro).await;
    }
    assert_eq!(log.lock().unwrap().reconnects, 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_while_idle_closes_the_gateway() {
    let gateway = ScriptedGateway::new();
    let sink = RecordingSink::new();
    let log = Arc::clone(&gateway.log);
    let (_micro, shutdown, handle) = start_bridge(gateway, sink, fast_policy());

    // Let the loop reach its idle wait, then pull the plug.
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.send(true).unwrap();

    timeout(Duration::from_millis(500), handle)
        .await
        .expect("loop did not observe shutdown")
        .unwrap()
        .unwrap();
    assert!(log.lock().unwrap().closed, "teardown must close the PLC session");
}

#[tokio::test]
async fn override_toggle_takes_effect_on_the_next_cycle() {
    let mut image = vec![false; 14];
    image[1] = true;
    let gateway = ScriptedGateway::new().with_actuator_image(image);
    let toggle = gateway.clone();
    let sink = RecordingSink::new();
    let (mut micro, shutdown, handle) = start_bridge(gateway, sink, fast_policy());

    micro.write_all(&scenario_frame()).await.unwrap();
    assert_eq!(read_reply(&mut micro, 1).await, [0xFF]);

    toggle.set_override(true);
    micro.write_all(&scenario_frame()).await.unwrap();
    assert_eq!(read_reply(&mut micro, 3).await, [0xBB, 0b0000_0010, 0]);

    toggle.set_override(false);
    micro.write_all(&scenario_frame()).await.unwrap();
    assert_eq!(read_reply(&mut micro, 1).await, [0xFF]);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
