//! Certificate cache (spec.md §4.5).
//!
//! Keyed by `"<server-addr>:<port>"`. Single-flight: the first requester
//! for a key inserts a pending holder and performs the dial; every
//! concurrent waiter observes the same holder, blocking on its readiness
//! latch until the first requester flips it, then reading stable bytes —
//! never a partially-initialized state (spec.md §3 invariant).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::metrics::Counters;
use crate::session::Session;

/// Parsed fields lifted from a peer's leaf certificate Subject/Issuer,
/// ready to attach to a session (spec.md §4.5 `attach_to_session`).
#[derive(Debug, Clone, Default)]
pub struct CertificateData {
    pub common_name: Option<String>,
    pub serial_number: Option<String>,
    pub country: Option<String>,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub locality: Option<String>,
    pub province: Option<String>,
    pub street_address: Option<String>,
    pub postal_code: Option<String>,
    pub san_dns_names: Vec<String>,
    pub der: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum CertFetchOutcome {
    Available(CertificateData),
    Unavailable,
}

enum CertState {
    Pending,
    Ready(CertFetchOutcome),
}

/// One endpoint's cache entry. Exactly one exists per endpoint key at any
/// instant (spec.md §3 invariant).
pub struct CertificateHolder {
    pub endpoint: String,
    pub created_at: Instant,
    state: Mutex<CertState>,
    ready: Notify,
}

impl CertificateHolder {
    fn new(endpoint: String) -> Self {
        CertificateHolder {
            endpoint,
            created_at: Instant::now(),
            state: Mutex::new(CertState::Pending),
            ready: Notify::new(),
        }
    }

    fn resolve(&self, outcome: CertFetchOutcome) {
        *self.state.lock() = CertState::Ready(outcome);
        self.ready.notify_waiters();
    }

    /// Blocks until the holder transitions out of pending, then returns a
    /// stable snapshot. The `Notified` future is captured *before* the
    /// state lock is released, so a `resolve()` landing in the window
    /// between the check and the await still wakes this waiter instead
    /// of being missed (spec.md §3: "all concurrent waiters block on the
    /// latch, then observe a stable holder").
    pub async fn wait_ready(&self) -> CertFetchOutcome {
        loop {
            let state = self.state.lock();
            if let CertState::Ready(outcome) = &*state {
                return outcome.clone();
            }
            let notified = self.ready.notified();
            drop(state);
            notified.await;
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.lock(), CertState::Ready(_))
    }
}

pub struct CertificateCache {
    entries: Mutex<HashMap<String, Arc<CertificateHolder>>>,
    counters: Arc<Counters>,
    ttl: Duration,
}

impl CertificateCache {
    pub fn new(counters: Arc<Counters>, ttl: Duration) -> Self {
        CertificateCache {
            entries: Mutex::new(HashMap::new()),
            counters,
            ttl,
        }
    }

    /// Single-flight fetch: at most one `dial` call runs per endpoint key
    /// at any instant, even under concurrent callers (spec.md §8
    /// quantified invariant).
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, dial: F) -> Arc<CertificateHolder>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = CertFetchOutcome>,
    {
        let (holder, is_new_requester) = {
            let mut entries = self.entries.lock();
            if let Some(existing) = entries.get(key) {
                Counters::bump(&self.counters.cert_cache_hits);
                (existing.clone(), false)
            } else {
                Counters::bump(&self.counters.cert_cache_misses);
                let holder = Arc::new(CertificateHolder::new(key.to_string()));
                entries.insert(key.to_string(), holder.clone());
                (holder, true)
            }
        };

        if is_new_requester {
            let outcome = dial(key.to_string()).await;
            holder.resolve(outcome);
        } else {
            Counters::bump(&self.counters.cert_cache_inflight_joins);
            holder.wait_ready().await;
        }

        holder
    }

    /// Populates the fixed attribute set derived from the certificate's
    /// Subject/Issuer, joining list-valued fields with `|` (spec.md §4.5).
    pub fn attach_to_session(session: &Session, cert: &CertificateData) {
        if let Some(cn) = &cert.common_name {
            session.set_attribute("certificate_subject_cn", cn);
        }
        if let Some(serial) = &cert.serial_number {
            session.set_attribute("certificate_serial_number", serial);
        }
        if let Some(country) = &cert.country {
            session.set_attribute("certificate_subject_country", country);
        }
        if let Some(org) = &cert.organization {
            session.set_attribute("certificate_subject_organization", org);
        }
        if let Some(ou) = &cert.organizational_unit {
            session.set_attribute("certificate_subject_organizational_unit", ou);
        }
        if let Some(locality) = &cert.locality {
            session.set_attribute("certificate_subject_locality", locality);
        }
        if let Some(province) = &cert.province {
            session.set_attribute("certificate_subject_province", province);
        }
        if let Some(street) = &cert.street_address {
            session.set_attribute("certificate_subject_street_address", street);
        }
        if let Some(postal) = &cert.postal_code {
            session.set_attribute("certificate_subject_postal_code", postal);
        }
        if !cert.san_dns_names.is_empty() {
            session.set_attribute("certificate_subject_alt_names", &cert.san_dns_names.join("|"));
        }
    }

    /// Removes holders older than the configured TTL (spec.md §4.5
    /// eviction, default ~24h).
    pub fn sweep(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, holder| holder.created_at.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn single_flight_dials_once_for_concurrent_requesters() {
        let counters = StdArc::new(Counters::new());
        let cache = StdArc::new(CertificateCache::new(counters, Duration::from_secs(60)));
        let dial_count = StdArc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let dial_count = dial_count.clone();
            joins.push(tokio::spawn(async move {
                let holder = cache
                    .get_or_fetch("203.0.113.10:443", move |_key| {
                        let dial_count = dial_count.clone();
                        async move {
                            dial_count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            CertFetchOutcome::Available(CertificateData {
                                common_name: Some("example.com".to_string()),
                                ..Default::default()
                            })
                        }
                    })
                    .await;
                holder.wait_ready().await
            }));
        }

        for join in joins {
            let outcome = join.await.unwrap();
            match outcome {
                CertFetchOutcome::Available(data) => {
                    assert_eq!(data.common_name.as_deref(), Some("example.com"));
                }
                CertFetchOutcome::Unavailable => panic!("expected available certificate"),
            }
        }

        assert_eq!(dial_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sweep_removes_entries_past_ttl() {
        let counters = StdArc::new(Counters::new());
        let cache = CertificateCache::new(counters, Duration::from_millis(1));
        cache
            .entries
            .lock()
            .insert("k".to_string(), Arc::new(CertificateHolder::new("k".to_string())));
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert_eq!(cache.len(), 0);
    }
}
