use std::time::Duration;

use gascard_lib::{FrameChannel, GascardError, LineConfig, SerialConfig, Terminator};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::time::sleep;

fn channel() -> (FrameChannel<DuplexStream>, DuplexStream) {
    let (client, server) = duplex(4096);
    let serial = SerialConfig {
        timeout_ms: 200,
        ..SerialConfig::default()
    };
    (FrameChannel::new(client, LineConfig::gascard(&serial)), server)
}

#[tokio::test(start_paused = true)]
async fn test_reads_whole_frames_in_order() {
    let (mut channel, mut device) = channel();
    device.write_all(b"N 1 2 3\r\nX 4 5\r\n").await.unwrap();

    assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("N 1 2 3"));
    assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("X 4 5"));
    assert_eq!(channel.read_line().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_frame_split_across_reads() {
    let (mut channel, mut device) = channel();
    tokio::spawn(async move {
        for chunk in [&b"C1 0."[..], b"98 1.0", b"1\r", b"\n"] {
            device.write_all(chunk).await.unwrap();
            sleep(Duration::from_millis(50)).await;
        }
        sleep(Duration::from_secs(5)).await;
    });
    assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("C1 0.98 1.01"));
}

#[tokio::test(start_paused = true)]
async fn test_resynchronizes_mid_stream() {
    let (mut channel, mut device) = channel();
    // Reading began halfway through a frame.
    device.write_all(b"23 CO2 N2 1\r\nU 1 CO2 N2 1\r\n").await.unwrap();

    assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("U 1 CO2 N2 1"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_discards_partial_frame() {
    let (mut channel, mut device) = channel();
    device.write_all(b"N 1 2").await.unwrap();
    assert_eq!(channel.read_line().await.unwrap(), None);

    // The tail of the abandoned frame arrives late and must not leak.
    device.write_all(b" 3\r\nN 4 5 6\r\n").await.unwrap();
    assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("N 4 5 6"));
}

#[tokio::test(start_paused = true)]
async fn test_nul_padding_is_kept_for_the_decoder() {
    let (mut channel, mut device) = channel();
    device.write_all(b"\0\0X 1 2\r\n").await.unwrap();
    assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("\0\0X 1 2"));
}

#[tokio::test(start_paused = true)]
async fn test_write_appends_terminator_and_drops_stale_input() {
    let (mut channel, mut device) = channel();
    device.write_all(b"N 9 9 9\r\n").await.unwrap();

    channel.write("X").await.unwrap();
    let mut received = [0u8; 3];
    device.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"X\r\n");

    device.write_all(b"X 1 2\r\n").await.unwrap();
    assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("X 1 2"));
}

#[tokio::test(start_paused = true)]
async fn test_write_then_read_line() {
    let (mut channel, device) = channel();
    let (mut rx, mut tx) = tokio::io::split(device);
    tokio::spawn(async move {
        let mut command = [0u8; 3];
        rx.read_exact(&mut command).await.unwrap();
        assert_eq!(&command, b"U\r\n");
        tx.write_all(b"U 1 CO2 N2 1\r\n").await.unwrap();
        sleep(Duration::from_secs(5)).await;
    });

    let reply = channel.write_then_read_line("U").await.unwrap();
    assert_eq!(reply.as_deref(), Some("U 1 CO2 N2 1"));
}

#[tokio::test(start_paused = true)]
async fn test_write_times_out_when_device_stalls() {
    let (client, _device) = duplex(4);
    let serial = SerialConfig {
        timeout_ms: 100,
        ..SerialConfig::default()
    };
    let mut channel = FrameChannel::new(client, LineConfig::gascard(&serial));
    let err = channel.write("T120 and a long tail").await.unwrap_err();
    assert!(matches!(err, GascardError::Timeout("write")));
}

#[tokio::test(start_paused = true)]
async fn test_rejects_non_ascii() {
    let (mut channel, mut device) = channel();
    assert!(matches!(channel.write("T5°").await, Err(GascardError::Encoding(_))));

    device.write_all("N 25°C\r\n".as_bytes()).await.unwrap();
    assert!(matches!(channel.read_line().await, Err(GascardError::Encoding(_))));
}

#[tokio::test(start_paused = true)]
async fn test_closed_and_disconnected() {
    let (mut channel, device) = channel();
    drop(device);
    assert!(matches!(channel.read_line().await, Err(GascardError::Disconnected)));

    channel.close().await.unwrap();
    channel.close().await.unwrap();
    assert!(!channel.is_open());
    assert!(matches!(channel.write("N").await, Err(GascardError::Closed)));
    assert!(matches!(channel.read_line().await, Err(GascardError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn test_alternate_terminator() {
    let (client, mut device) = duplex(4096);
    let serial = SerialConfig {
        terminator: Terminator::Cr,
        ..SerialConfig::default()
    };
    let mut channel = FrameChannel::new(client, LineConfig::gascard(&serial));
    device.write_all(b"O1 1 2\rE1 3 4\r").await.unwrap();
    assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("O1 1 2"));
    assert_eq!(channel.read_line().await.unwrap().as_deref(), Some("E1 3 4"));
}
