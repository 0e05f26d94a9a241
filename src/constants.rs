//! Protocol-wide constants: message caps, resource limits, timeouts,
//! misbehavior penalties.
//!
//! Everything that bounds an attacker lives here so the limits can be
//! audited in one place.

/// Protocol version spoken by this node.
pub const PROTOCOL_VERSION: i32 = 1;

/// Oldest protocol version we still talk to.
pub const MIN_PROTOCOL_VERSION: i32 = 1;

/// Hard cap on a single wire message payload (frame `length` field).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Hard cap on any decoded VarInt. Bounds pre-allocation attacks.
pub const MAX_VARINT: u64 = 32 * 1024 * 1024;

/// Incremental reservation chunk for size-prefixed containers.
pub const ALLOC_CHUNK_BYTES: usize = 5 * 1024 * 1024;

/// Per-message item caps for size-prefixed containers.
pub const MAX_ADDR_PER_MSG: u64 = 1000;
pub const MAX_INV_PER_MSG: u64 = 50_000;
pub const MAX_HEADERS_PER_MSG: u64 = 2000;
pub const MAX_LOCATOR_HASHES: u64 = 101;

/// User agent strings longer than this are a protocol violation.
pub const MAX_USER_AGENT_LEN: usize = 256;

/// Per-peer receive buffer cap. Unprocessed bytes beyond this disconnect
/// the peer, bounding process memory at peers * RECV_FLOOD_LIMIT.
pub const RECV_FLOOD_LIMIT: usize = 5 * 1024 * 1024;

/// Orphan header pool limits.
pub const MAX_ORPHAN_HEADERS: usize = 1000;
pub const MAX_ORPHANS_PER_PEER: usize = 50;
pub const ORPHAN_TTL_SECS: u64 = 600;

/// Connection slots.
pub const MAX_OUTBOUND_FULL: usize = 8;
pub const MAX_INBOUND: usize = 125;
pub const MAX_ANCHOR_SLOTS: usize = 3;

/// Timeouts (seconds).
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 60;
pub const INACTIVITY_TIMEOUT_SECS: u64 = 20 * 60;
pub const PING_INTERVAL_SECS: u64 = 2 * 60;
pub const PING_TIMEOUT_SECS: u64 = 20 * 60;
pub const CONNECT_TIMEOUT_SECS: u64 = 30;
pub const HEADER_SYNC_STALL_SECS: u64 = 20 * 60;
pub const ANCHOR_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Discouragement quarantine. In-memory only, shorter than a manual ban.
pub const DISCOURAGEMENT_SECS: u64 = 24 * 60 * 60;

/// Bounded size of the in-memory discouragement filter.
pub const MAX_DISCOURAGED: usize = 50_000;

/// Misbehavior score at which a peer is discouraged and disconnected.
pub const DISCOURAGEMENT_THRESHOLD: u32 = 100;

/// Misbehavior penalties.
pub const PENALTY_INVALID_POW: u32 = 100;
pub const PENALTY_INVALID_HEADER: u32 = 100;
pub const PENALTY_OVERSIZED: u32 = 20;
pub const PENALTY_NON_CONTINUOUS: u32 = 20;
pub const PENALTY_UNCONNECTING: u32 = 100;
pub const PENALTY_TOO_MANY_ORPHANS: u32 = 100;
pub const PENALTY_LOW_WORK: u32 = 10;

/// HEADERS batches starting at an unknown parent beyond this count get the
/// peer disconnected.
pub const MAX_UNCONNECTING_HEADERS: u32 = 10;

/// Blocks connected per chainstate-lock acquisition during activation.
pub const ACTIVATION_BATCH: usize = 32;

/// Headers must not be more than this far ahead of network-adjusted time.
pub const MAX_FUTURE_DRIFT_SECS: u64 = 2 * 60 * 60;

/// Timestamps must beat the median of this many previous headers.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Address manager shape.
pub const ADDRMAN_BUCKETS: usize = 256;
pub const ADDRMAN_BUCKET_SIZE: usize = 64;
pub const ADDRMAN_MAX_FAILURES: u32 = 10;
pub const ADDRMAN_HORIZON_SECS: u64 = 30 * 24 * 60 * 60;
/// Probability (percent) of drawing from the tried table.
pub const ADDRMAN_TRIED_BIAS_PCT: u32 = 80;

/// Cap on failed-block ids kept in the failed cache.
pub const MAX_FAILED_CACHE: usize = 1000;

/// Bounded sample set for the network-adjusted clock.
pub const TIMEDATA_MAX_SAMPLES: usize = 199;
/// Offsets beyond this are ignored (and a warning is logged once).
pub const TIMEDATA_MAX_OFFSET_SECS: i64 = 70 * 60;
