//! Connection-Dict bridge (spec.md §4.4).
//!
//! The kernel exposes three pseudo-files under a fixed path: `write`,
//! `read`, `all`. The `read` endpoint is stateful — a caller writes the id
//! it wants, then reads the resulting snapshot back from the same file —
//! so a process-wide lock serializes all reads. Writes are serialized
//! only among themselves, keyed per (ctid, field), and never block reads.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sentry_common::dict::{parse_snapshot, write_line};

use crate::error::StartupError;

const WRITE_FILE: &str = "write";
const READ_FILE: &str = "read";
const ALL_FILE: &str = "all";

/// Synchronous face over the kernel's conntrack dictionary pseudo-files,
/// driven from a dedicated blocking task per call so it never stalls the
/// async runtime's worker threads.
pub struct DictBridge {
    base_path: PathBuf,
    read_lock: Arc<Mutex<()>>,
    write_locks: Arc<Mutex<HashMap<(u32, String), Arc<Mutex<()>>>>>,
}

impl DictBridge {
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StartupError> {
        let base_path = base_path.into();
        for name in [WRITE_FILE, READ_FILE, ALL_FILE] {
            let path = base_path.join(name);
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|source| StartupError::DictOpen {
                    path: path.display().to_string(),
                    source,
                })?;
        }
        Ok(DictBridge {
            base_path,
            read_lock: Arc::new(Mutex::new(())),
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn lock_for(&self, ctid: u32, field: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .entry((ctid, field.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Mirrors `Session::set_attribute` into the kernel dictionary.
    pub async fn write(&self, ctid: u32, field: &str, value: &str) -> std::io::Result<()> {
        let path = self.base_path.join(WRITE_FILE);
        let lock = self.lock_for(ctid, field);
        let line = write_line(ctid, field, value);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            let mut f = OpenOptions::new().write(true).open(&path)?;
            f.write_all(line.as_bytes())
        })
        .await
        .expect("blocking dict write task panicked")
    }

    /// Writes `ctid` to the `read` pseudo-file, then reads back the
    /// per-id snapshot it produces, under the process-wide read lock.
    pub async fn read(&self, ctid: u32) -> std::io::Result<Vec<(String, String)>> {
        let path = self.base_path.join(READ_FILE);
        let lock = self.read_lock.clone();
        let body = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            let mut f = OpenOptions::new().read(true).write(true).open(&path)?;
            writeln!(f, "id={}", ctid)?;
            let mut buf = String::new();
            f.read_to_string(&mut buf)?;
            std::io::Result::Ok(buf)
        })
        .await
        .expect("blocking dict read task panicked")?;
        Ok(parse_snapshot(&body))
    }

    /// Global dump of every tracked flow currently in the kernel dict.
    pub async fn all(&self) -> std::io::Result<String> {
        let path = self.base_path.join(ALL_FILE);
        tokio::task::spawn_blocking(move || std::fs::read_to_string(&path))
            .await
            .expect("blocking dict all task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pseudo_files(dir: &Path) {
        for name in [WRITE_FILE, READ_FILE, ALL_FILE] {
            std::fs::File::create(dir.join(name)).unwrap();
        }
    }

    #[tokio::test]
    async fn write_produces_expected_wire_line() {
        let dir = tempfile::tempdir().unwrap();
        make_pseudo_files(dir.path());
        let bridge = DictBridge::open(dir.path()).unwrap();
        bridge.write(42, "certificate_subject_cn", "a,b").await.unwrap();
        let contents = std::fs::read_to_string(dir.path().join(WRITE_FILE)).unwrap();
        assert_eq!(contents, "id=42,field=certificate_subject_cn,value=a-b\n");
    }

    #[tokio::test]
    async fn open_fails_when_pseudo_files_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DictBridge::open(dir.path()).is_err());
    }
}
