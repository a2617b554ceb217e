//! Classification service (spec.md §4.6).
//!
//! A fixed pool of workers, each owning one long-lived TLS connection to
//! the upstream predictor, drains a shared request channel. The public
//! API is synchronous from the caller's point of view: `classify` awaits
//! a reply on a per-request oneshot channel regardless of which worker
//! eventually answers it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use sentry_common::{ClassifiedTraffic, Protocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::metrics::Counters;
use crate::tls;

const DIAL_DEADLINE: Duration = Duration::from_secs(10);
const IO_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassifyKey {
    pub server_addr: IpAddr,
    pub server_port: u16,
    pub protocol: Protocol,
}

struct CacheEntry {
    value: ClassifiedTraffic,
    last_access: SyncMutex<Instant>,
}

struct ClassifyRequest {
    key: ClassifyKey,
    reply: oneshot::Sender<ClassifiedTraffic>,
    attempt_count: u32,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub auth_key: String,
}

pub struct ClassificationService {
    sender: mpsc::Sender<ClassifyRequest>,
    cache: SyncMutex<HashMap<ClassifyKey, Arc<CacheEntry>>>,
    counters: Arc<Counters>,
    ttl: Duration,
    max_attempts: u32,
}

impl ClassificationService {
    /// Spawns `worker_count` persistent-connection workers
    /// (spec.md §4.6 "fixed worker pool (≈ CPU count)"). `worker_count ==
    /// 0` resolves to the host's CPU count, matching the spec's own
    /// default and keeping the retry budget (`CPU_count + 1`) grounded in
    /// the pool size that actually gets spawned.
    pub fn spawn(
        worker_count: usize,
        upstream: UpstreamConfig,
        counters: Arc<Counters>,
        ttl: Duration,
    ) -> Arc<Self> {
        let worker_count = if worker_count == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            worker_count
        };

        let (sender, receiver) = mpsc::channel::<ClassifyRequest>(1024);
        let shared_receiver = Arc::new(AsyncMutex::new(receiver));
        let max_attempts = worker_count as u32 + 1;

        let service = Arc::new(ClassificationService {
            sender: sender.clone(),
            cache: SyncMutex::new(HashMap::new()),
            counters: counters.clone(),
            ttl,
            max_attempts,
        });

        for _ in 0..worker_count {
            let receiver = shared_receiver.clone();
            let sender = sender.clone();
            let upstream = upstream.clone();
            let counters = counters.clone();
            let max_attempts = max_attempts;
            tokio::spawn(async move {
                run_worker(receiver, sender, upstream, counters, max_attempts).await;
            });
        }

        service
    }

    /// Looks up the cache first; on miss, enqueues a request and awaits
    /// the worker's reply. The "unknown" sentinel is cached too, so
    /// non-answering endpoints are not retried within the TTL.
    pub async fn classify(&self, key: ClassifyKey) -> ClassifiedTraffic {
        if let Some(entry) = self.cache.lock().get(&key) {
            *entry.last_access.lock() = Instant::now();
            Counters::bump(&self.counters.classify_cache_hits);
            return entry.value.clone();
        }
        Counters::bump(&self.counters.classify_cache_misses);

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ClassifyRequest {
            key: key.clone(),
            reply: reply_tx,
            attempt_count: 0,
        };

        if self.sender.send(request).await.is_err() {
            return ClassifiedTraffic::unknown();
        }

        let result = reply_rx.await.unwrap_or_else(|_| ClassifiedTraffic::unknown());
        self.cache.lock().insert(
            key,
            Arc::new(CacheEntry {
                value: result.clone(),
                last_access: SyncMutex::new(Instant::now()),
            }),
        );
        result
    }

    /// Removes entries whose last access exceeds the TTL (~24h).
    pub fn sweep(&self) {
        let mut cache = self.cache.lock();
        cache.retain(|_, entry| entry.last_access.lock().elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }
}

async fn run_worker(
    receiver: Arc<AsyncMutex<mpsc::Receiver<ClassifyRequest>>>,
    sender: mpsc::Sender<ClassifyRequest>,
    upstream: UpstreamConfig,
    counters: Arc<Counters>,
    max_attempts: u32,
) {
    let mut stream = None;
    loop {
        let request = {
            let mut guard = receiver.lock().await;
            match guard.recv().await {
                Some(req) => req,
                None => return, // channel closed: shutdown drained it already
            }
        };

        if stream.is_none() {
            stream = tls::dial(&upstream.host, upstream.port, DIAL_DEADLINE).await.ok();
        }

        let outcome = match &mut stream {
            Some(s) => perform_request(s, &request.key, &upstream).await,
            None => Err(crate::error::ClassifyError::DialFailed(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no upstream connection",
            ))),
        };

        match outcome {
            Ok(traffic) => {
                let _ = request.reply.send(traffic);
            }
            Err(_transport_fault) => {
                // Recycle the connection before the next iteration
                // regardless of retry outcome (spec.md §4.6 worker loop).
                stream = None;
                let attempt_count = request.attempt_count + 1;
                if attempt_count <= max_attempts {
                    Counters::bump(&counters.classify_retries);
                    let retry = ClassifyRequest {
                        key: request.key,
                        reply: request.reply,
                        attempt_count,
                    };
                    if sender.send(retry).await.is_err() {
                        // channel gone; nothing left to reply to.
                    }
                } else {
                    Counters::bump(&counters.classify_unknown_replies);
                    let _ = request.reply.send(ClassifiedTraffic::unknown());
                }
            }
        }
    }
}

async fn perform_request(
    stream: &mut tokio_rustls::client::TlsStream<tokio::net::TcpStream>,
    key: &ClassifyKey,
    upstream: &UpstreamConfig,
) -> Result<ClassifiedTraffic, crate::error::ClassifyError> {
    use crate::error::ClassifyError;

    let request = format!(
        "GET /v1/traffic?ip={}&port={}&protocolId={} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: sentryd\r\n\
         Content-Type: application/json\r\n\
         AuthRequest: {}\r\n\
         Connection: Keep-Alive\r\n\r\n",
        key.server_addr,
        key.server_port,
        key.protocol.number(),
        upstream.host,
        upstream.auth_key,
    );

    tokio::time::timeout(IO_DEADLINE, stream.write_all(request.as_bytes()))
        .await
        .map_err(|_| ClassifyError::Timeout)?
        .map_err(ClassifyError::Reset)?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(IO_DEADLINE, stream.read(&mut chunk))
            .await
            .map_err(|_| ClassifyError::Timeout)?
            .map_err(ClassifyError::Reset)?;
        if n == 0 {
            return Err(ClassifyError::Reset(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "upstream closed connection",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        let has_header_end = find_subslice(&buf, b"\r\n\r\n").is_some();
        let ends_with_brace = buf.iter().rposition(|&b| !b.is_ascii_whitespace()) == Some(buf.len() - 1)
            && buf.last() == Some(&b'}');
        if has_header_end && ends_with_brace {
            break;
        }
    }

    let header_end = find_subslice(&buf, b"\r\n\r\n").unwrap();
    let header = String::from_utf8_lossy(&buf[..header_end]);
    let body = &buf[header_end + 4..];

    let status_line = header.lines().next().unwrap_or("");
    let status_code: u32 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    if status_code != 200 {
        return Ok(ClassifiedTraffic::unknown());
    }

    serde_json::from_slice(body)
        .map_err(|e| ClassifyError::MalformedResponse(e.to_string()))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentry_common::Protocol;
    use std::net::Ipv4Addr;

    fn key() -> ClassifyKey {
        ClassifyKey {
            server_addr: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            server_port: 443,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn find_subslice_locates_header_terminator() {
        let buf = b"HTTP/1.1 200 OK\r\n\r\n{}";
        assert_eq!(find_subslice(buf, b"\r\n\r\n"), Some(15));
    }

    #[tokio::test]
    async fn cache_hit_avoids_second_upstream_round_trip() {
        let counters = Arc::new(Counters::new());
        let service = ClassificationService::spawn(
            1,
            UpstreamConfig {
                host: "127.0.0.1".to_string(),
                port: 1, // nothing listens here; first lookup degrades to unknown
                auth_key: "k".to_string(),
            },
            counters.clone(),
            Duration::from_secs(60),
        );

        let first = service.classify(key()).await;
        assert!(first.is_unknown());
        assert_eq!(service.len(), 1);

        let second = service.classify(key()).await;
        assert!(second.is_unknown());
        assert_eq!(counters.snapshot().classify_cache_hits, 1);
    }
}
