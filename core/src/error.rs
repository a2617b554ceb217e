//! Error kinds for the engine (spec.md §7).

use thiserror::Error;

/// Fatal startup failures — the orchestrator sets shutdown and exits
/// non-zero on these (spec.md §7 "Kernel-API failure at startup").
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind packet queue {queue_num}: {source}")]
    QueueBind {
        queue_num: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open conntrack netlink socket: {0}")]
    ConntrackOpen(#[source] std::io::Error),
    #[error("failed to open netfilter log socket: {0}")]
    NetlogOpen(#[source] std::io::Error),
    #[error("failed to open connection-dict pseudo-files at {path}: {source}")]
    DictOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open warehouse capture file at {path}: {source}")]
    CaptureOpen {
        path: String,
        #[source]
        source: WarehouseError,
    },
}

/// Steady-state kernel I/O faults — counted, loop continues
/// (spec.md §7 "Kernel-API failure at steady state").
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("short frame ({0} bytes)")]
    ShortFrame(usize),
    #[error("unknown L3 family byte {0:#x}")]
    UnknownFamily(u8),
    #[error("conntrack id missing from packet attributes")]
    MissingCtid,
    #[error("malformed conntrack message: {0}")]
    MalformedConntrack(String),
    #[error("transient recv error: {0}")]
    Transient(#[source] std::io::Error),
    #[error("fatal recv error: {0}")]
    Fatal(#[source] std::io::Error),
}

impl KernelError {
    /// `EINTR`/`EAGAIN`/`ENOBUFS` are transient: the receive loop continues.
    /// Any other errno recycles the socket handle (spec.md §7).
    pub fn from_raw_os_error(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::ENOBUFS) => {
                KernelError::Transient(err)
            }
            _ => KernelError::Fatal(err),
        }
    }
}

/// Certificate cache failures.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("TLS dial to {endpoint} timed out")]
    DialTimeout { endpoint: String },
    #[error("TLS dial to {endpoint} failed: {source}")]
    DialFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("peer presented no certificate")]
    NoCertificate,
    #[error("failed to parse peer certificate: {0}")]
    ParseFailed(String),
}

/// Classification service failures, all of which degrade to the "unknown"
/// sentinel rather than propagating (spec.md §7 "Transient transport").
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("upstream dial failed: {0}")]
    DialFailed(#[source] std::io::Error),
    #[error("upstream read/write timed out")]
    Timeout,
    #[error("upstream connection reset: {0}")]
    Reset(#[source] std::io::Error),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("retry budget exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Warehouse capture/replay failures.
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    Frame(#[from] sentry_common::capture::WarehouseError),
    #[error("capture file not enabled")]
    NotEnabled,
}
