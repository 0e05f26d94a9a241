//! Domain-specific error types for the node.
//!
//! Structured errors instead of a String/anyhow mix. Wire, protocol and DoS
//! errors are recovered at the peer boundary (log + disconnect + optional
//! score); validation errors propagate to the accept-header call site;
//! storage corruption is fatal only for the header store.

use thiserror::Error;

/// Frame / payload decoding errors. All of these disconnect the peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("bad network magic")]
    BadMagic,

    #[error("oversized message: {0} bytes")]
    OversizedMessage(usize),

    #[error("payload checksum mismatch")]
    BadChecksum,

    #[error("truncated payload")]
    TruncatedPayload,

    #[error("malformed varint")]
    BadVarInt,

    #[error("container count {count} exceeds cap {cap}")]
    ContainerTooLarge { count: u64, cap: u64 },
}

/// Handshake and session-level protocol violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("duplicate version message")]
    DuplicateVersion,

    #[error("verack received before version")]
    VerackBeforeVersion,

    #[error("connected to self")]
    SelfConnection,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(i32),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("user agent too long: {0} bytes")]
    UserAgentTooLong(usize),
}

/// Header validation failure kinds. Returned as data inside `AcceptOutcome`,
/// never by unwinding.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("genesis hash mismatch")]
    BadGenesis,

    #[error("block version rejected")]
    BadVersion,

    #[error("proof of work failed")]
    BadPoW,

    #[error("incorrect difficulty bits")]
    BadDifficulty,

    #[error("timestamp not past median of previous headers")]
    TimeTooOld,

    #[error("timestamp too far in the future")]
    TimeTooNew,

    #[error("previous block invalid")]
    BadPrev,

    #[error("orphan pool limit reached")]
    OrphanLimit,

    #[error("block already known invalid")]
    CachedFail,
}

/// Per-peer resource cap violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("receive buffer flooded: {0} bytes")]
    RecvFloodOverflow(usize),

    #[error("orphan pool full")]
    OrphanPoolFull,

    #[error("per-peer orphan limit reached")]
    PerPeerOrphanLimit,
}

/// Denial-of-service policy outcomes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DoSError {
    #[error("misbehavior score {0}")]
    Misbehavior(u32),

    #[error("peer is discouraged")]
    Discouraged,

    #[error("peer is banned")]
    Banned,

    #[error("too many unconnecting header batches")]
    TooManyUnconnecting,

    #[error("too many orphan headers")]
    TooManyOrphans,
}

/// Proof-of-work engine failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    #[error("target bits are not canonical")]
    NonCanonicalTarget,

    #[error("commitment exceeds target")]
    CommitmentExceedsTarget,

    #[error("recomputed artifact does not match commitment")]
    ArtifactMismatch,
}

/// Persistence errors. Only `CorruptHeaders` aborts startup.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("corrupt header store: {0}")]
    CorruptHeaders(String),

    #[error("corrupt peers file: {0}")]
    CorruptPeers(String),

    #[error("corrupt ban list: {0}")]
    CorruptBanlist(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Unified node error type.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("dos error: {0}")]
    Dos(#[from] DoSError),

    #[error("pow error: {0}")]
    Pow(#[from] PowError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for node operations.
pub type NodeResult<T> = Result<T, NodeError>;
