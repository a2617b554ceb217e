//! Warehouse capture file format (spec.md §4.7, §6).
//!
//! Only format version 2.0 (split monotonic seconds/nanoseconds) is
//! produced or accepted. Version 1 (a single monolithic nanosecond
//! timestamp) is a known prior variant and is rejected with a typed error
//! rather than silently misparsed (spec.md §9(c)).

use std::io::{self, Read, Write};

pub const SIGNATURE: &[u8; 8] = b"UTPDCF\0\0";
pub const DESCRIPTION_LEN: usize = 48;
pub const CURRENT_MAJOR: u32 = 2;
pub const CURRENT_MINOR: u32 = 0;

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("bad capture signature")]
    BadSignature,
    #[error("unsupported capture file version {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },
    #[error("truncated capture frame")]
    Truncated,
    #[error("unknown frame origin byte {0}")]
    UnknownOrigin(u8),
}

/// Origin of a captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOrigin {
    Queue,
    Conntrack,
    NetLog,
}

impl CaptureOrigin {
    fn to_byte(self) -> u8 {
        match self {
            CaptureOrigin::Queue => b'Q',
            CaptureOrigin::Conntrack => b'C',
            CaptureOrigin::NetLog => b'L',
        }
    }

    fn from_byte(b: u8) -> Result<Self, WarehouseError> {
        match b {
            b'Q' => Ok(CaptureOrigin::Queue),
            b'C' => Ok(CaptureOrigin::Conntrack),
            b'L' => Ok(CaptureOrigin::NetLog),
            other => Err(WarehouseError::UnknownOrigin(other)),
        }
    }
}

/// File-level header: description, signature, major/minor version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub description: String,
}

impl FileHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), WarehouseError> {
        let mut desc = [0u8; DESCRIPTION_LEN];
        let bytes = self.description.as_bytes();
        let n = bytes.len().min(DESCRIPTION_LEN);
        desc[..n].copy_from_slice(&bytes[..n]);
        w.write_all(&desc)?;
        w.write_all(SIGNATURE)?;
        w.write_all(&CURRENT_MAJOR.to_le_bytes())?;
        w.write_all(&CURRENT_MINOR.to_le_bytes())?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, WarehouseError> {
        let mut desc = [0u8; DESCRIPTION_LEN];
        r.read_exact(&mut desc)?;
        let description = String::from_utf8_lossy(&desc)
            .trim_end_matches('\0')
            .to_string();

        let mut sig = [0u8; 8];
        r.read_exact(&mut sig)?;
        if &sig != SIGNATURE {
            return Err(WarehouseError::BadSignature);
        }

        let mut major_buf = [0u8; 4];
        r.read_exact(&mut major_buf)?;
        let major = u32::from_le_bytes(major_buf);

        let mut minor_buf = [0u8; 4];
        r.read_exact(&mut minor_buf)?;
        let minor = u32::from_le_bytes(minor_buf);

        if major != CURRENT_MAJOR {
            return Err(WarehouseError::UnsupportedVersion { major, minor });
        }

        Ok(FileHeader { description })
    }
}

/// One captured event: header fields plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub origin: CaptureOrigin,
    pub mono_secs: u64,
    pub mono_nanos: u32,
    pub mark: u32,
    pub ctid: u32,
    pub nfid: u32,
    pub payload: Vec<u8>,
}

impl CapturedFrame {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), WarehouseError> {
        w.write_all(&[self.origin.to_byte()])?;
        w.write_all(&self.mono_secs.to_le_bytes())?;
        w.write_all(&self.mono_nanos.to_le_bytes())?;
        w.write_all(&(self.payload.len() as u32).to_le_bytes())?;
        w.write_all(&self.mark.to_le_bytes())?;
        w.write_all(&self.ctid.to_le_bytes())?;
        w.write_all(&self.nfid.to_le_bytes())?;
        w.write_all(&self.payload)?;
        Ok(())
    }

    /// Returns `Ok(None)` on clean EOF before any byte of a new frame.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>, WarehouseError> {
        let mut origin_buf = [0u8; 1];
        match r.read(&mut origin_buf)? {
            0 => return Ok(None),
            _ => {}
        }

        let origin = CaptureOrigin::from_byte(origin_buf[0])?;

        let mut secs_buf = [0u8; 8];
        r.read_exact(&mut secs_buf).map_err(|_| WarehouseError::Truncated)?;
        let mono_secs = u64::from_le_bytes(secs_buf);

        let mut nanos_buf = [0u8; 4];
        r.read_exact(&mut nanos_buf).map_err(|_| WarehouseError::Truncated)?;
        let mono_nanos = u32::from_le_bytes(nanos_buf);

        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf).map_err(|_| WarehouseError::Truncated)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut mark_buf = [0u8; 4];
        r.read_exact(&mut mark_buf).map_err(|_| WarehouseError::Truncated)?;
        let mark = u32::from_le_bytes(mark_buf);

        let mut ctid_buf = [0u8; 4];
        r.read_exact(&mut ctid_buf).map_err(|_| WarehouseError::Truncated)?;
        let ctid = u32::from_le_bytes(ctid_buf);

        let mut nfid_buf = [0u8; 4];
        r.read_exact(&mut nfid_buf).map_err(|_| WarehouseError::Truncated)?;
        let nfid = u32::from_le_bytes(nfid_buf);

        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).map_err(|_| WarehouseError::Truncated)?;

        Ok(Some(CapturedFrame {
            origin,
            mono_secs,
            mono_nanos,
            mark,
            ctid,
            nfid,
            payload,
        }))
    }

    /// Replay ctids have their high nibble forced to 0xF (spec.md §4.7).
    pub fn replay_ctid(&self) -> u32 {
        (self.ctid & 0x0FFF_FFFF) | 0xF000_0000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn file_header_round_trips() {
        let header = FileHeader {
            description: "capture for test run".to_string(),
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let decoded = FileHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut buf = vec![0u8; DESCRIPTION_LEN];
        buf.extend_from_slice(b"NOTMAGIC");
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        let err = FileHeader::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, WarehouseError::BadSignature));
    }

    #[test]
    fn rejects_v1_files() {
        let mut buf = vec![0u8; DESCRIPTION_LEN];
        buf.extend_from_slice(SIGNATURE);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        let err = FileHeader::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(
            err,
            WarehouseError::UnsupportedVersion { major: 1, minor: 0 }
        ));
    }

    #[test]
    fn frame_round_trips_with_payload() {
        let frame = CapturedFrame {
            origin: CaptureOrigin::Queue,
            mono_secs: 12345,
            mono_nanos: 6789,
            mark: 0xA5,
            ctid: 4242,
            nfid: 99,
            payload: vec![1, 2, 3, 4, 5],
        };
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        let decoded = CapturedFrame::read_from(&mut Cursor::new(buf))
            .unwrap()
            .unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn replay_ctid_forces_high_nibble() {
        let frame = CapturedFrame {
            origin: CaptureOrigin::Conntrack,
            mono_secs: 0,
            mono_nanos: 0,
            mark: 0,
            ctid: 0x1234_5678,
            nfid: 0,
            payload: vec![],
        };
        assert_eq!(frame.replay_ctid(), 0xF234_5678);
    }

    #[test]
    fn read_from_returns_none_at_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(CapturedFrame::read_from(&mut empty).unwrap().is_none());
    }
}
