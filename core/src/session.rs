//! Session Table (spec.md §4.2).
//!
//! The map from conntrack id to `Session` is guarded by a single lock held
//! only for map mutation; once a `Session` is looked up, callers manipulate
//! it through its own interior-mutable fields so that packets belonging to
//! the same session from distinct workers can run concurrently (spec.md
//! §4.2 concurrency contract).

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use sentry_common::FiveTuple;

use crate::dict::DictBridge;
use crate::metrics::Counters;

/// Per-direction packet/byte counters.
#[derive(Debug, Default)]
pub struct DirectionCounters {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
}

impl DirectionCounters {
    fn record(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// One tracked flow, keyed by conntrack id.
pub struct Session {
    pub ctid: u32,
    pub tuple: FiveTuple,
    pub created_at: SystemTime,
    last_activity: Mutex<Instant>,
    pub client_to_server: DirectionCounters,
    pub server_to_client: DirectionCounters,
    attachments: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    attributes: Mutex<HashMap<String, String>>,
    released: Mutex<HashSet<String>>,
    mark: AtomicU32,
    /// Present when the engine was built with a live kernel dict bridge;
    /// `set_attribute` mirrors through it (spec.md §4.2/§4.4). `None` in
    /// unit tests and replay mode, where there is no kernel dict to write.
    dict: Option<Arc<DictBridge>>,
}

impl Session {
    fn new(ctid: u32, tuple: FiveTuple, dict: Option<Arc<DictBridge>>) -> Self {
        Session {
            ctid,
            tuple,
            created_at: SystemTime::now(),
            last_activity: Mutex::new(Instant::now()),
            client_to_server: DirectionCounters::default(),
            server_to_client: DirectionCounters::default(),
            attachments: Mutex::new(HashMap::new()),
            attributes: Mutex::new(HashMap::new()),
            released: Mutex::new(HashSet::new()),
            mark: AtomicU32::new(0),
            dict,
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn record_packet(&self, from_client: bool, bytes: usize) {
        self.touch();
        if from_client {
            self.client_to_server.record(bytes);
        } else {
            self.server_to_client.record(bytes);
        }
    }

    pub fn mark(&self) -> u32 {
        self.mark.load(Ordering::Relaxed)
    }

    /// Folds `new_mark` into the running mark with bitwise-OR, returning
    /// the updated value (spec.md §3 mark monotonicity invariant).
    pub fn fold_mark(&self, new_mark: u32) -> u32 {
        self.mark.fetch_or(new_mark, Ordering::Relaxed) | new_mark
    }

    pub fn attach(&self, owner: &str, value: Arc<dyn Any + Send + Sync>) {
        self.attachments.lock().insert(owner.to_string(), value);
    }

    pub fn get_attachment(&self, owner: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attachments.lock().get(owner).cloned()
    }

    /// Records the attribute locally and, when a kernel dict bridge is
    /// attached, mirrors it into the conntrack dictionary in the
    /// background so the caller (a plugin handler) never blocks the
    /// dispatch thread on the write (spec.md §4.2).
    pub fn set_attribute(&self, key: &str, value: &str) {
        self.attributes.lock().insert(key.to_string(), value.to_string());
        if let Some(dict) = self.dict.clone() {
            let ctid = self.ctid;
            let key = key.to_string();
            let value = value.to_string();
            tokio::spawn(async move {
                if let Err(err) = dict.write(ctid, &key, &value).await {
                    log::warn!("dict mirror write failed for ctid {ctid} field {key}: {err}");
                }
            });
        }
    }

    pub fn get_attribute(&self, key: &str) -> Option<String> {
        self.attributes.lock().get(key).cloned()
    }

    pub fn attributes_snapshot(&self) -> HashMap<String, String> {
        self.attributes.lock().clone()
    }

    pub fn mark_released(&self, owner: &str) {
        self.released.lock().insert(owner.to_string());
    }

    pub fn is_released(&self, owner: &str) -> bool {
        self.released.lock().contains(owner)
    }

    /// True once every subscriber named in `all_owners` has released.
    pub fn released_all(&self, all_owners: &[String]) -> bool {
        let released = self.released.lock();
        all_owners.iter().all(|o| released.contains(o))
    }
}

/// Map from conntrack id to `Session`, with a background sweeper.
pub struct SessionTable {
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
    counters: Arc<Counters>,
    dict: Option<Arc<DictBridge>>,
}

impl SessionTable {
    pub fn new(counters: Arc<Counters>) -> Self {
        SessionTable {
            sessions: Mutex::new(HashMap::new()),
            counters,
            dict: None,
        }
    }

    /// Attaches the kernel dict bridge every `Session` created from this
    /// point on will mirror its attributes into (spec.md §4.2). Used by
    /// the orchestrator; unit tests use the bridge-less `new` instead.
    pub fn with_dict(mut self, dict: Arc<DictBridge>) -> Self {
        self.dict = Some(dict);
        self
    }

    /// Created on the first packet event whose ctid is unknown, or on a
    /// NEW conntrack event — whichever arrives first (spec.md §3).
    pub fn find_or_create(&self, ctid: u32, tuple: FiveTuple) -> (Arc<Session>, bool) {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&ctid) {
            return (existing.clone(), false);
        }
        let session = Arc::new(Session::new(ctid, tuple, self.dict.clone()));
        sessions.insert(ctid, session.clone());
        Counters::bump(&self.counters.sessions_created);
        (session, true)
    }

    pub fn find(&self, ctid: u32) -> Option<Arc<Session>> {
        self.sessions.lock().get(&ctid).cloned()
    }

    /// Destroyed on the DESTROY conntrack event or explicit eviction.
    /// A stray packet after eviction is a no-op (spec.md §5).
    pub fn evict(&self, ctid: u32) -> Option<Arc<Session>> {
        let removed = self.sessions.lock().remove(&ctid);
        if removed.is_some() {
            Counters::bump(&self.counters.sessions_evicted);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// One-minute sweep: evict any session whose ctid is absent from the
    /// latest conntrack dump and whose last activity exceeds `min_idle`
    /// (spec.md §4.2 garbage collection).
    pub fn sweep(&self, live_ctids: &HashSet<u32>, min_idle: std::time::Duration) {
        let stale: Vec<u32> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .filter(|(ctid, session)| {
                    !live_ctids.contains(ctid) && session.idle_for() >= min_idle
                })
                .map(|(ctid, _)| *ctid)
                .collect()
        };
        for ctid in stale {
            self.evict(ctid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentry_common::Protocol;
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple() -> FiveTuple {
        FiveTuple {
            protocol: Protocol::Tcp,
            client_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 5555,
            server_addr: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            server_port: 443,
        }
    }

    #[test]
    fn find_or_create_reports_creation_only_once() {
        let table = SessionTable::new(Arc::new(Counters::new()));
        let (_s1, created1) = table.find_or_create(1, tuple());
        let (_s2, created2) = table.find_or_create(1, tuple());
        assert!(created1);
        assert!(!created2);
    }

    #[test]
    fn evict_is_noop_on_unknown_ctid() {
        let table = SessionTable::new(Arc::new(Counters::new()));
        assert!(table.evict(999).is_none());
    }

    #[test]
    fn mark_folds_bitwise_or() {
        let table = SessionTable::new(Arc::new(Counters::new()));
        let (session, _) = table.find_or_create(7, tuple());
        session.fold_mark(0b0001);
        session.fold_mark(0b0100);
        assert_eq!(session.mark(), 0b0101);
    }

    #[test]
    fn released_all_requires_every_owner() {
        let table = SessionTable::new(Arc::new(Counters::new()));
        let (session, _) = table.find_or_create(9, tuple());
        let owners = vec!["dns".to_string(), "threat".to_string()];
        assert!(!session.released_all(&owners));
        session.mark_released("dns");
        assert!(!session.released_all(&owners));
        session.mark_released("threat");
        assert!(session.released_all(&owners));
    }

    #[test]
    fn sweep_evicts_only_idle_and_absent_sessions() {
        let table = SessionTable::new(Arc::new(Counters::new()));
        table.find_or_create(1, tuple());
        table.find_or_create(2, tuple());
        let mut live = HashSet::new();
        live.insert(2);
        // min_idle of zero means "idle immediately" is satisfied for ctid 1.
        table.sweep(&live, std::time::Duration::from_secs(0));
        assert!(table.find(1).is_none());
        assert!(table.find(2).is_some());
    }

    #[tokio::test]
    async fn set_attribute_mirrors_into_dict_bridge_when_attached() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["write", "read", "all"] {
            std::fs::File::create(dir.path().join(name)).unwrap();
        }
        let dict = Arc::new(DictBridge::open(dir.path()).unwrap());
        let table = SessionTable::new(Arc::new(Counters::new())).with_dict(dict);
        let (session, _) = table.find_or_create(11, tuple());

        session.set_attribute("certificate_subject_cn", "example.com");
        assert_eq!(session.get_attribute("certificate_subject_cn").as_deref(), Some("example.com"));

        // the mirror write is spawned off the calling task; give it a
        // turn to land before inspecting the pseudo-file.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let written = std::fs::read_to_string(dir.path().join("write")).unwrap();
        assert_eq!(written, "id=11,field=certificate_subject_cn,value=example.com\n");
    }

    #[test]
    fn set_attribute_without_dict_bridge_stays_in_memory_only() {
        let table = SessionTable::new(Arc::new(Counters::new()));
        let (session, _) = table.find_or_create(12, tuple());
        session.set_attribute("dns_query_name", "example.com");
        assert_eq!(session.get_attribute("dns_query_name").as_deref(), Some("example.com"));
    }
}
