//! NFQUEUE transport (spec.md §4.1).
//!
//! Thin wrapper around the `nfq` crate: bind one queue number per worker,
//! decode the minimal fields the pipeline needs out of each message, and
//! post verdicts back. The guard logic in the parent module stays pure
//! and is exercised directly; this module is the part that actually
//! touches a netlink socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nfq::{Message, Queue, Verdict as NfqVerdict};
use sentry_common::Verdict;

use crate::error::{KernelError, StartupError};
use crate::kernel::{guard_frame, GuardOutcome, PacketEvent};
use crate::metrics::Counters;

fn to_nfq_verdict(verdict: Verdict) -> NfqVerdict {
    match verdict {
        Verdict::Accept => NfqVerdict::Accept,
        Verdict::Drop => NfqVerdict::Drop,
        Verdict::Repeat => NfqVerdict::Repeat,
    }
}

/// One bound NFQUEUE handle. `queue_index` identifies which worker this
/// is, purely for logging and `PacketEvent::queue_index`.
///
/// A packet's `nfq::Message` must outlive the async round trip through
/// the dispatch pipeline before it can be verdicted, so `recv` stashes
/// it here keyed by nfid and `submit_verdict` pulls it back out. Entries
/// left behind by a worker that never verdicts (e.g. it was told to
/// shut down mid-flight) are harmless: the kernel's own queue timeout
/// eventually drops the packet.
pub struct QueueWorker {
    queue: Queue,
    queue_index: usize,
    shutdown: Arc<AtomicBool>,
    pending: HashMap<u32, Message>,
    counters: Arc<Counters>,
}

impl QueueWorker {
    pub fn bind(
        queue_num: u16,
        queue_index: usize,
        shutdown: Arc<AtomicBool>,
        counters: Arc<Counters>,
    ) -> Result<Self, StartupError> {
        let mut queue = Queue::open().map_err(|source| StartupError::QueueBind { queue_num, source })?;
        queue
            .bind(queue_num)
            .map_err(|source| StartupError::QueueBind { queue_num, source })?;
        Ok(QueueWorker {
            queue,
            queue_index,
            shutdown,
            pending: HashMap::new(),
            counters,
        })
    }

    /// Blocks for the next message, decoding it into a `PacketEvent`, or
    /// returns `Ok(None)` once the guard rejects the frame and the
    /// kernel has already been told to accept it with mark 0 — callers
    /// should not forward those to the dispatch pipeline.
    pub fn recv(&mut self) -> Result<Option<PacketEvent>, KernelError> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(None);
            }
            let mut message = match self.queue.recv() {
                Ok(msg) => msg,
                Err(err) => return Err(KernelError::from_raw_os_error(err)),
            };

            let payload = message.get_payload().to_vec();
            match guard_frame(&payload) {
                GuardOutcome::Short => {
                    Counters::bump(&self.counters.garbage_frames);
                    message.set_verdict(NfqVerdict::Accept);
                    let _ = self.queue.verdict(message);
                    continue;
                }
                GuardOutcome::UnknownFamily(_) => {
                    Counters::bump(&self.counters.unknown_family);
                    message.set_verdict(NfqVerdict::Accept);
                    let _ = self.queue.verdict(message);
                    continue;
                }
                GuardOutcome::Ok { family } => {
                    let ctid = message.get_conntrack_id();
                    let nfid = message.get_id();
                    self.pending.insert(nfid, message);
                    return Ok(Some(PacketEvent {
                        queue_index: self.queue_index,
                        nfid,
                        ctid,
                        family,
                        payload,
                    }));
                }
            }
        }
    }

    /// Posts a verdict plus packet mark for a previously received nfid.
    /// A missing entry (already verdicted, or dropped by a restart)
    /// counts as a fatal-grade mismatch: the caller would otherwise
    /// spin retrying a packet the kernel has already forgotten about.
    pub fn submit_verdict(&mut self, nfid: u32, verdict: Verdict, mark: u32) -> Result<(), KernelError> {
        let mut message = self.pending.remove(&nfid).ok_or(KernelError::MissingCtid)?;
        message.set_verdict(to_nfq_verdict(verdict));
        message.set_mark(mark);
        self.queue
            .verdict(message)
            .map_err(KernelError::from_raw_os_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_mapping_matches_nf_constants() {
        assert_eq!(to_nfq_verdict(Verdict::Accept), NfqVerdict::Accept);
        assert_eq!(to_nfq_verdict(Verdict::Drop), NfqVerdict::Drop);
        assert_eq!(to_nfq_verdict(Verdict::Repeat), NfqVerdict::Repeat);
    }
}
