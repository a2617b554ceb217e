//! Warehouse capture/replay (spec.md §4.7).
//!
//! Capture mode taps every packet, conntrack, and netlog event before
//! decoding and appends it to a capture file. Replay mode reads that file
//! back and re-injects frames into the same callbacks live mode uses,
//! pacing them by the captured inter-frame delay scaled by `100/speed`.

use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sentry_common::{CaptureOrigin, CapturedFrame, FileHeader};
use tokio::sync::mpsc;

use crate::error::WarehouseError;

/// Appends every tapped event to a capture file. Cheap to clone; the
/// underlying writer is behind a mutex since packets from distinct
/// workers may be captured concurrently.
#[derive(Clone)]
pub struct Capturer {
    writer: Arc<Mutex<BufWriter<std::fs::File>>>,
}

impl Capturer {
    pub fn create(path: impl AsRef<Path>, description: &str) -> Result<Self, WarehouseError> {
        let file = std::fs::File::create(path).map_err(sentry_common::capture::WarehouseError::Io)?;
        let mut writer = BufWriter::new(file);
        FileHeader {
            description: description.to_string(),
        }
        .write_to(&mut writer)?;
        Ok(Capturer {
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn capture(&self, frame: &CapturedFrame) -> Result<(), WarehouseError> {
        let mut writer = self.writer.lock();
        frame.write_to(&mut *writer)?;
        writer.flush().map_err(sentry_common::capture::WarehouseError::Io)?;
        Ok(())
    }
}

/// One injected event, handed to the same callbacks live mode feeds.
#[derive(Debug, Clone)]
pub struct ReplayEvent {
    pub origin: CaptureOrigin,
    pub ctid: u32,
    pub nfid: u32,
    pub mark: u32,
    pub payload: Vec<u8>,
}

impl From<&CapturedFrame> for ReplayEvent {
    fn from(frame: &CapturedFrame) -> Self {
        ReplayEvent {
            origin: frame.origin,
            ctid: frame.replay_ctid(),
            nfid: frame.nfid,
            mark: frame.mark,
            payload: frame.payload.clone(),
        }
    }
}

/// Reads a capture file and replays it at `speed_percent` of real time.
/// `0` means no pacing (as fast as possible); `100` is real-time.
pub async fn replay(
    path: impl AsRef<Path>,
    speed_percent: u32,
    sink: mpsc::Sender<ReplayEvent>,
) -> Result<(), WarehouseError> {
    let file = std::fs::File::open(path).map_err(sentry_common::capture::WarehouseError::Io)?;
    let mut reader = BufReader::new(file);
    let _header = FileHeader::read_from(&mut reader)?;

    let mut prev_timestamp: Option<(u64, u32)> = None;

    loop {
        let frame = match CapturedFrame::read_from(&mut reader)? {
            Some(frame) => frame,
            None => break,
        };

        if let Some((prev_secs, prev_nanos)) = prev_timestamp {
            let delay = inter_frame_delay(
                prev_secs,
                prev_nanos,
                frame.mono_secs,
                frame.mono_nanos,
                speed_percent,
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        prev_timestamp = Some((frame.mono_secs, frame.mono_nanos));

        if sink.send(ReplayEvent::from(&frame)).await.is_err() {
            break; // receiver gone; replay stops early
        }
    }

    Ok(())
}

/// `(this.timestamp - prev.timestamp) * (100 / speed)` (spec.md §4.7).
/// `speed_percent == 0` disables pacing entirely.
fn inter_frame_delay(
    prev_secs: u64,
    prev_nanos: u32,
    this_secs: u64,
    this_nanos: u32,
    speed_percent: u32,
) -> Duration {
    if speed_percent == 0 {
        return Duration::ZERO;
    }
    let prev = Duration::new(prev_secs, prev_nanos);
    let this = Duration::new(this_secs, this_nanos);
    let raw = this.saturating_sub(prev);
    raw * 100 / speed_percent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_scales_inversely_with_speed() {
        let prev = (0u64, 0u32);
        let this = (1u64, 0u32);
        let at_100 = inter_frame_delay(prev.0, prev.1, this.0, this.1, 100);
        let at_200 = inter_frame_delay(prev.0, prev.1, this.0, this.1, 200);
        assert_eq!(at_100, Duration::from_secs(1));
        assert_eq!(at_200, Duration::from_millis(500));
    }

    #[test]
    fn zero_speed_disables_pacing() {
        assert_eq!(
            inter_frame_delay(0, 0, 10, 0, 0),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn capture_then_replay_round_trips_payload_and_forces_high_nibble() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.utpdcf");

        let capturer = Capturer::create(&path, "test capture").unwrap();
        capturer
            .capture(&CapturedFrame {
                origin: CaptureOrigin::Queue,
                mono_secs: 0,
                mono_nanos: 0,
                mark: 0,
                ctid: 0x1234,
                nfid: 1,
                payload: vec![0xDE, 0xAD],
            })
            .unwrap();
        capturer
            .capture(&CapturedFrame {
                origin: CaptureOrigin::Conntrack,
                mono_secs: 0,
                mono_nanos: 500_000_000,
                mark: 7,
                ctid: 0x1234,
                nfid: 2,
                payload: vec![],
            })
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        replay(&path, 0, tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, vec![0xDE, 0xAD]);
        assert_eq!(first.ctid, 0xF000_1234);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.mark, 7);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn rejects_v1_capture_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1.utpdcf");
        let mut buf = vec![0u8; sentry_common::capture::DESCRIPTION_LEN];
        buf.extend_from_slice(sentry_common::capture::SIGNATURE);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(&path, buf).unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let err = replay(&path, 100, tx).await.unwrap_err();
        assert!(matches!(
            err,
            WarehouseError::Frame(sentry_common::capture::WarehouseError::UnsupportedVersion {
                major: 1,
                ..
            })
        ));
    }
}
