//! Network-adjusted clock.
//!
//! Collects one clock-offset sample per peer (from the VERSION timestamp)
//! and applies the median, capped so a majority of skewed peers cannot
//! drag the node further than the sanity bound.

use crate::constants::{TIMEDATA_MAX_OFFSET_SECS, TIMEDATA_MAX_SAMPLES};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Wall-clock seconds since the epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Default)]
struct Inner {
    offsets: Vec<i64>,
    sampled: HashSet<IpAddr>,
    applied: i64,
    warned: bool,
}

#[derive(Default)]
pub struct TimeData {
    inner: Mutex<Inner>,
}

impl TimeData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample per peer address. `offset` is peer_time - our_time.
    pub fn add_sample(&self, addr: IpAddr, offset: i64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.offsets.len() >= TIMEDATA_MAX_SAMPLES || !inner.sampled.insert(addr) {
            return;
        }
        let pos = inner.offsets.partition_point(|&o| o < offset);
        inner.offsets.insert(pos, offset);

        // recompute on odd counts so the median is a real sample
        if inner.offsets.len() >= 5 && inner.offsets.len() % 2 == 1 {
            let median = inner.offsets[inner.offsets.len() / 2];
            if median.abs() <= TIMEDATA_MAX_OFFSET_SECS {
                inner.applied = median;
            } else {
                inner.applied = 0;
                if !inner.warned {
                    inner.warned = true;
                    warn!(
                        median_offset = median,
                        "peer clocks disagree with ours beyond the sanity bound; \
                         check the local clock"
                    );
                }
            }
        }
    }

    pub fn offset(&self) -> i64 {
        self.inner.lock().applied
    }

    /// Current network-adjusted time.
    pub fn adjusted_time(&self) -> u64 {
        let now = unix_now() as i64 + self.offset();
        now.max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn no_adjustment_below_five_samples() {
        let td = TimeData::new();
        for i in 0..4 {
            td.add_sample(ip(i), 100);
        }
        assert_eq!(td.offset(), 0);
    }

    #[test]
    fn median_applied_at_five_samples() {
        let td = TimeData::new();
        for (i, off) in [10i64, 20, 30, 40, 50].iter().enumerate() {
            td.add_sample(ip(i as u8), *off);
        }
        assert_eq!(td.offset(), 30);
    }

    #[test]
    fn duplicate_peer_counted_once() {
        let td = TimeData::new();
        for _ in 0..10 {
            td.add_sample(ip(1), 500);
        }
        assert_eq!(td.offset(), 0);
    }

    #[test]
    fn oversized_median_ignored() {
        let td = TimeData::new();
        for i in 0..5 {
            td.add_sample(ip(i), TIMEDATA_MAX_OFFSET_SECS + 100);
        }
        assert_eq!(td.offset(), 0);
    }
}
