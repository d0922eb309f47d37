//! Serial Link Abstractions
//!
//! The bridge talks to the microcontroller over an async byte stream and
//! never cares which concrete type backs it. Anything implementing the
//! tokio I/O traits qualifies:
//! - `tokio_serial::SerialStream` (the real RS-232 link)
//! - `tokio::io::DuplexStream` (tests playing the microcontroller role)
//!
//! [`open_serial`] applies the plant's fixed line settings (8N1, no flow
//! control); only the device path and baud rate come from configuration.

use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Trait alias for the async serial link.
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialIo for T {}

/// Type-erased boxed serial link.
pub type DynSerial = Box<dyn SerialIo>;

/// Open the microcontroller serial port with the plant's line settings.
///
/// Opening a serial device can block on driver calls, so the open runs
/// under `spawn_blocking` rather than on the async runtime directly.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
pub async fn open_serial(
    port_path: &str,
    baud_rate: u32,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open microcontroller serial port: {}",
                port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Discard bytes buffered on the link before the bridge started.
///
/// The microcontroller transmits regardless of whether anybody listens, so
/// the OS buffer usually holds a partial frame at startup. Frames are
/// fixed-length with no mid-stream resynchronization; a stale half-frame
/// would misalign every frame after it. Draining once before the first
/// read avoids that. Returns the number of bytes discarded.
pub async fn drain_stale_bytes<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        if tokio::time::Instant::now() >= deadline {
            break;
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF or no more data
            Ok(Ok(n)) => {
                total_discarded += n;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(_)) => break, // Real I/O error, abort drain
            Err(_) => break,     // Timeout, no more immediate data
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn boxed_duplex_implements_serial_io() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut port: DynSerial = Box::new(device);

        host.write_all(&[0xAA, 1, 2, 3]).await.unwrap();

        let mut buf = [0u8; 4];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0xAA, 1, 2, 3]);
    }

    #[tokio::test]
    async fn drain_discards_buffered_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);

        host.write_all(b"stale half frame").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_stale_bytes(&mut device, 50).await;
        assert_eq!(discarded, 16);

        // Nothing left afterwards.
        let mut buf = [0u8; 1];
        let res = tokio::time::timeout(Duration::from_millis(10), device.read(&mut buf)).await;
        assert!(matches!(res, Err(_) | Ok(Ok(0))));
    }

    #[tokio::test]
    async fn drain_on_idle_link_returns_zero() {
        let (_host, mut device) = tokio::io::duplex(64);
        let discarded = drain_stale_bytes(&mut device, 20).await;
        assert_eq!(discarded, 0);
    }
}
