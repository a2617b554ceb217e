//! Dispatch Pipeline (spec.md §4.3).
//!
//! Subscribers are ordered by integer priority, lower running earlier.
//! The priority values themselves (`dns: 1`, `certfetch: 2`, ...) are
//! merely integers the built-in plugins happen to register with — nothing
//! in the pipeline treats them as meaningful beyond ordering.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use sentry_common::{FiveTuple, Verdict};
use tokio::time::timeout;

use crate::metrics::Counters;
use crate::session::{Session, SessionTable};

/// Default per-handler deadline (spec.md §4.3 handler contract).
pub const DEFAULT_HANDLER_DEADLINE: Duration = Duration::from_secs(10);

/// What a packet's pipeline pass hands every subscriber.
#[derive(Debug, Clone)]
pub struct PluginMessage {
    pub ctid: u32,
    pub tuple: FiveTuple,
    pub payload: Arc<Vec<u8>>,
}

/// What a subscriber hands back for one packet.
#[derive(Debug, Clone)]
pub struct PluginOutcome {
    pub packet_mark: u32,
    pub session_release: bool,
    /// Non-`Accept` escalates the packet's final verdict (spec.md §8
    /// scenario 4: a flagged session gets a non-accept verdict).
    pub verdict: Verdict,
}

impl Default for PluginOutcome {
    fn default() -> Self {
        PluginOutcome {
            packet_mark: 0,
            session_release: false,
            verdict: Verdict::Accept,
        }
    }
}

/// A pipeline subscriber. Handlers must not block the dispatch thread
/// beyond the configured deadline; blocking I/O belongs in a background
/// worker or behind a single-flight gate, with the handler itself
/// releasing the session immediately (spec.md §4.3 handler contract).
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    async fn handle(
        &self,
        session: &Arc<Session>,
        message: &PluginMessage,
        new_session: bool,
    ) -> PluginOutcome;
}

struct Subscriber {
    owner: String,
    priority: i32,
    plugin: Arc<dyn Plugin>,
}

/// Outcome of one dispatch pass, handed to the kernel adapter to answer
/// the queue (spec.md §4.3 step 4).
#[derive(Debug, Clone, Copy)]
pub struct DispatchResult {
    pub verdict: Verdict,
    pub mark: u32,
}

pub struct Pipeline {
    subscribers: Vec<Subscriber>,
    handler_deadline: Duration,
    counters: Arc<Counters>,
}

impl Pipeline {
    pub fn new(counters: Arc<Counters>) -> Self {
        Pipeline {
            subscribers: Vec::new(),
            handler_deadline: DEFAULT_HANDLER_DEADLINE,
            counters,
        }
    }

    pub fn with_handler_deadline(mut self, deadline: Duration) -> Self {
        self.handler_deadline = deadline;
        self
    }

    /// Registers a subscriber and keeps the registry sorted by priority.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let owner = plugin.name().to_string();
        let priority = plugin.priority();
        self.subscribers.push(Subscriber {
            owner,
            priority,
            plugin,
        });
        self.subscribers.sort_by_key(|s| s.priority);
    }

    pub fn owners(&self) -> Vec<String> {
        self.subscribers.iter().map(|s| s.owner.clone()).collect()
    }

    /// Runs one packet through the pipeline for conntrack id `ctid`.
    /// `new_session` is true for every handler invocation on the packet
    /// that transitioned the session into existence (spec.md §4.3
    /// "new_session flag").
    pub async fn dispatch(
        &self,
        table: &SessionTable,
        ctid: u32,
        tuple: FiveTuple,
        payload: Vec<u8>,
    ) -> DispatchResult {
        let (session, created) = table.find_or_create(ctid, tuple);
        let owners = self.owners();

        if session.released_all(&owners) {
            return DispatchResult {
                verdict: Verdict::Accept,
                mark: session.mark(),
            };
        }

        let message = PluginMessage {
            ctid,
            tuple,
            payload: Arc::new(payload),
        };

        let mut verdict = Verdict::Accept;

        for subscriber in &self.subscribers {
            if session.is_released(&subscriber.owner) {
                continue;
            }

            let plugin = subscriber.plugin.clone();
            let session_cloned = session.clone();
            let message_cloned = message.clone();

            let call = AssertUnwindSafe(plugin.handle(&session_cloned, &message_cloned, created))
                .catch_unwind();

            match timeout(self.handler_deadline, call).await {
                Ok(Ok(outcome)) => {
                    session.fold_mark(outcome.packet_mark);
                    if outcome.session_release {
                        session.mark_released(&subscriber.owner);
                    }
                    if outcome.verdict != Verdict::Accept {
                        verdict = outcome.verdict;
                    }
                }
                Ok(Err(_panic)) => {
                    log::warn!(
                        "plugin '{}' panicked handling ctid {}; releasing and continuing",
                        subscriber.owner,
                        ctid
                    );
                    Counters::bump(&self.counters.plugin_panics);
                    session.mark_released(&subscriber.owner);
                }
                Err(_elapsed) => {
                    log::warn!(
                        "plugin '{}' timed out handling ctid {}; forcing accept",
                        subscriber.owner,
                        ctid
                    );
                    Counters::bump(&self.counters.plugin_timeouts);
                    session.mark_released(&subscriber.owner);
                    Counters::bump(&self.counters.verdicts_submitted);
                    return DispatchResult {
                        verdict: Verdict::Accept,
                        mark: session.mark(),
                    };
                }
            }
        }

        Counters::bump(&self.counters.verdicts_submitted);
        DispatchResult {
            verdict,
            mark: session.mark(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sentry_common::Protocol;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tuple() -> FiveTuple {
        FiveTuple {
            protocol: Protocol::Tcp,
            client_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 1,
            server_addr: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            server_port: 443,
        }
    }

    struct MarkPlugin {
        priority: i32,
        mark: u32,
        release: bool,
    }

    #[async_trait]
    impl Plugin for MarkPlugin {
        fn name(&self) -> &str {
            "mark"
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn handle(&self, _s: &Arc<Session>, _m: &PluginMessage, _n: bool) -> PluginOutcome {
            PluginOutcome {
                packet_mark: self.mark,
                session_release: self.release,
                verdict: Verdict::Accept,
            }
        }
    }

    struct PanicPlugin;

    #[async_trait]
    impl Plugin for PanicPlugin {
        fn name(&self) -> &str {
            "panics"
        }
        fn priority(&self) -> i32 {
            0
        }
        async fn handle(&self, _s: &Arc<Session>, _m: &PluginMessage, _n: bool) -> PluginOutcome {
            panic!("boom");
        }
    }

    struct CountingPlugin {
        priority: i32,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            "counter"
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn handle(&self, _s: &Arc<Session>, _m: &PluginMessage, _n: bool) -> PluginOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            PluginOutcome::default()
        }
    }

    struct NewSessionFlagPlugin {
        seen: Arc<Mutex<Vec<bool>>>,
    }

    #[async_trait]
    impl Plugin for NewSessionFlagPlugin {
        fn name(&self) -> &str {
            "flagcheck"
        }
        fn priority(&self) -> i32 {
            1
        }
        async fn handle(&self, _s: &Arc<Session>, _m: &PluginMessage, new: bool) -> PluginOutcome {
            self.seen.lock().push(new);
            PluginOutcome::default()
        }
    }

    #[tokio::test]
    async fn folds_marks_bitwise_or_across_subscribers() {
        let counters = Arc::new(Counters::new());
        let table = SessionTable::new(counters.clone());
        let mut pipeline = Pipeline::new(counters);
        pipeline.register(Arc::new(MarkPlugin {
            priority: 1,
            mark: 0b0001,
            release: false,
        }));
        pipeline.register(Arc::new(MarkPlugin {
            priority: 2,
            mark: 0b0100,
            release: false,
        }));

        let result = pipeline.dispatch(&table, 1, tuple(), vec![1, 2, 3]).await;
        assert_eq!(result.mark, 0b0101);
        assert_eq!(result.verdict, Verdict::Accept);
    }

    #[tokio::test]
    async fn released_session_skips_all_handlers() {
        let counters = Arc::new(Counters::new());
        let table = SessionTable::new(counters.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new(counters);
        pipeline.register(Arc::new(CountingPlugin {
            priority: 1,
            calls: calls.clone(),
        }));

        pipeline.dispatch(&table, 5, tuple(), vec![]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let session = table.find(5).unwrap();
        session.mark_released("counter");
        pipeline.dispatch(&table, 5, tuple(), vec![]).await;
        // released_all short-circuits before any handler runs again.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_plugin_is_isolated_and_released() {
        let counters = Arc::new(Counters::new());
        let table = SessionTable::new(counters.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new(counters.clone());
        pipeline.register(Arc::new(PanicPlugin));
        pipeline.register(Arc::new(CountingPlugin {
            priority: 5,
            calls: calls.clone(),
        }));

        let result = pipeline.dispatch(&table, 2, tuple(), vec![]).await;
        assert_eq!(result.verdict, Verdict::Accept);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(counters.snapshot().plugin_panics, 1);

        let session = table.find(2).unwrap();
        assert!(session.is_released("panics"));
    }

    #[tokio::test]
    async fn new_session_flag_true_only_on_first_packet() {
        let counters = Arc::new(Counters::new());
        let table = SessionTable::new(counters.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new(counters);
        pipeline.register(Arc::new(NewSessionFlagPlugin { seen: seen.clone() }));

        pipeline.dispatch(&table, 3, tuple(), vec![]).await;
        pipeline.dispatch(&table, 3, tuple(), vec![]).await;

        assert_eq!(*seen.lock(), vec![true, false]);
    }
}
