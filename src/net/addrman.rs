//! Address manager: who we could connect to.
//!
//! Two fixed-shape tables: `new` (heard about) and `tried` (connected at
//! least once), 256 buckets x 64 slots each. Bucket placement is keyed
//! SipHash over the address, so a flooding peer cannot aim its addresses
//! at chosen buckets. Selection draws from `tried` 80% of the time.

use crate::constants::{
    ADDRMAN_BUCKETS, ADDRMAN_BUCKET_SIZE, ADDRMAN_HORIZON_SECS, ADDRMAN_MAX_FAILURES,
    ADDRMAN_TRIED_BIAS_PCT,
};
use crate::timedata::unix_now;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::Hasher;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddrInfo {
    pub addr: SocketAddr,
    pub services: u64,
    pub last_seen: u64,
    pub last_attempt: u64,
    pub last_success: u64,
    pub attempts: u32,
}

impl AddrInfo {
    fn new(addr: SocketAddr, services: u64, last_seen: u64) -> Self {
        Self {
            addr,
            services,
            last_seen,
            last_attempt: 0,
            last_success: 0,
            attempts: 0,
        }
    }

    /// An address not worth dialing: repeatedly failed with no recent
    /// success, too stale, or claiming to be from the future.
    pub fn is_terrible(&self, now: u64) -> bool {
        if self.last_seen > now + 600 {
            return true;
        }
        if self.last_seen + ADDRMAN_HORIZON_SECS < now {
            return true;
        }
        if self.attempts >= ADDRMAN_MAX_FAILURES && self.last_success == 0 {
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    New,
    Tried,
}

#[derive(Serialize, Deserialize)]
pub struct AddrManSnapshot {
    key: [u8; 16],
    new: Vec<AddrInfo>,
    tried: Vec<AddrInfo>,
}

pub struct AddrMan {
    key: [u8; 16],
    new: Vec<Option<AddrInfo>>,
    tried: Vec<Option<AddrInfo>>,
    locations: HashMap<SocketAddr, (Table, usize)>,
}

impl Default for AddrMan {
    fn default() -> Self {
        Self::new()
    }
}

impl AddrMan {
    pub fn new() -> Self {
        Self::with_key(rand::random())
    }

    pub fn with_key(key: [u8; 16]) -> Self {
        let slots = ADDRMAN_BUCKETS * ADDRMAN_BUCKET_SIZE;
        Self {
            key,
            new: vec![None; slots],
            tried: vec![None; slots],
            locations: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    fn hash(&self, domain: u8, data: &[u8]) -> u64 {
        let mut hasher = SipHasher13::new_with_key(&self.key);
        hasher.write_u8(domain);
        hasher.write(data);
        hasher.finish()
    }

    /// Deterministic slot for an address within a table. The bucket is
    /// derived from the /16-style group so one subnet cannot fill the
    /// table, the slot from the full address.
    fn slot_for(&self, table: Table, addr: &SocketAddr) -> usize {
        let domain = match table {
            Table::New => 0u8,
            Table::Tried => 1u8,
        };
        let group = match addr.ip() {
            IpAddr::V4(v4) => v4.octets()[..2].to_vec(),
            IpAddr::V6(v6) => v6.octets()[..4].to_vec(),
        };
        let ip_bytes = match addr.ip() {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let bucket = (self.hash(domain, &group) as usize) % ADDRMAN_BUCKETS;
        let mut slot_data = ip_bytes;
        slot_data.extend_from_slice(&addr.port().to_le_bytes());
        let slot = (self.hash(domain + 2, &slot_data) as usize) % ADDRMAN_BUCKET_SIZE;
        bucket * ADDRMAN_BUCKET_SIZE + slot
    }

    /// Record a heard-about address. Known addresses refresh `last_seen`;
    /// fresh ones go in the `new` table, losing deterministic collisions
    /// unless the incumbent is terrible.
    pub fn add(&mut self, addr: SocketAddr, services: u64, last_seen: u64) -> bool {
        if addr.ip().is_unspecified() || addr.port() == 0 {
            return false;
        }
        if let Some(&(table, slot)) = self.locations.get(&addr) {
            let entry = match table {
                Table::New => self.new[slot].as_mut(),
                Table::Tried => self.tried[slot].as_mut(),
            };
            if let Some(info) = entry {
                info.last_seen = info.last_seen.max(last_seen);
                info.services = services;
            }
            return false;
        }
        let slot = self.slot_for(Table::New, &addr);
        let now = unix_now();
        match &self.new[slot] {
            Some(existing) if !existing.is_terrible(now) => {
                debug!(%addr, "address bucket collision, keeping incumbent");
                false
            }
            _ => {
                if let Some(evicted) = self.new[slot].take() {
                    self.locations.remove(&evicted.addr);
                }
                self.new[slot] = Some(AddrInfo::new(addr, services, last_seen));
                self.locations.insert(addr, (Table::New, slot));
                true
            }
        }
    }

    pub fn add_many(&mut self, entries: impl IntoIterator<Item = (SocketAddr, u64, u64)>) -> usize {
        let mut added = 0;
        for (addr, services, last_seen) in entries {
            if self.add(addr, services, last_seen) {
                added += 1;
            }
        }
        added
    }

    pub fn mark_attempt(&mut self, addr: &SocketAddr) {
        if let Some(info) = self.get_mut(addr) {
            info.attempts += 1;
            info.last_attempt = unix_now();
        }
    }

    /// A successful handshake moves the address into `tried`.
    pub fn mark_good(&mut self, addr: &SocketAddr) {
        let now = unix_now();
        let Some(&(table, slot)) = self.locations.get(addr) else {
            // connected to someone we never heard of (e.g. manual):
            // record them first
            self.add(*addr, 0, now);
            if self.locations.contains_key(addr) {
                self.mark_good(addr);
            }
            return;
        };
        {
            let entry = match table {
                Table::New => self.new[slot].as_mut(),
                Table::Tried => self.tried[slot].as_mut(),
            };
            if let Some(info) = entry {
                info.attempts = 0;
                info.last_success = now;
                info.last_seen = now;
            }
        }
        if table == Table::Tried {
            return;
        }
        // promote: only over an empty or terrible tried slot
        let tried_slot = self.slot_for(Table::Tried, addr);
        let can_promote = match &self.tried[tried_slot] {
            None => true,
            Some(occupant) => occupant.is_terrible(now),
        };
        if !can_promote {
            return;
        }
        if let Some(evicted) = self.tried[tried_slot].take() {
            self.locations.remove(&evicted.addr);
        }
        if let Some(info) = self.new[slot].take() {
            self.locations.remove(addr);
            self.locations.insert(info.addr, (Table::Tried, tried_slot));
            self.tried[tried_slot] = Some(info);
        }
    }

    fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut AddrInfo> {
        let &(table, slot) = self.locations.get(addr)?;
        match table {
            Table::New => self.new[slot].as_mut(),
            Table::Tried => self.tried[slot].as_mut(),
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&AddrInfo> {
        let &(table, slot) = self.locations.get(addr)?;
        match table {
            Table::New => self.new[slot].as_ref(),
            Table::Tried => self.tried[slot].as_ref(),
        }
    }

    /// Pick a dial target: tried with probability 80%, falling back to
    /// whichever table has usable entries. Terrible addresses are skipped.
    pub fn select(&self, rng: &mut impl Rng) -> Option<AddrInfo> {
        let now = unix_now();
        let prefer_tried = rng.gen_range(0..100) < ADDRMAN_TRIED_BIAS_PCT;
        let order = if prefer_tried {
            [Table::Tried, Table::New]
        } else {
            [Table::New, Table::Tried]
        };
        for table in order {
            let slots = match table {
                Table::New => &self.new,
                Table::Tried => &self.tried,
            };
            let usable: Vec<&AddrInfo> = slots
                .iter()
                .flatten()
                .filter(|info| !info.is_terrible(now))
                .collect();
            if let Some(info) = usable.choose(rng) {
                return Some((*info).clone());
            }
        }
        None
    }

    /// Random non-terrible sample for a GETADDR response.
    pub fn sample(&self, max: usize, rng: &mut impl Rng) -> Vec<AddrInfo> {
        let now = unix_now();
        let mut all: Vec<&AddrInfo> = self
            .new
            .iter()
            .chain(self.tried.iter())
            .flatten()
            .filter(|info| !info.is_terrible(now))
            .collect();
        all.shuffle(rng);
        all.into_iter().take(max).cloned().collect()
    }

    pub fn snapshot(&self) -> AddrManSnapshot {
        AddrManSnapshot {
            key: self.key,
            new: self.new.iter().flatten().cloned().collect(),
            tried: self.tried.iter().flatten().cloned().collect(),
        }
    }

    /// Rebuild from a snapshot; placements are re-derived from the
    /// persisted key so they stay stable across restarts.
    pub fn from_snapshot(snapshot: AddrManSnapshot) -> Self {
        let mut addrman = Self::with_key(snapshot.key);
        for info in snapshot.new {
            let slot = addrman.slot_for(Table::New, &info.addr);
            if addrman.new[slot].is_none() {
                addrman.locations.insert(info.addr, (Table::New, slot));
                addrman.new[slot] = Some(info);
            }
        }
        for info in snapshot.tried {
            let slot = addrman.slot_for(Table::Tried, &info.addr);
            if addrman.tried[slot].is_none() && !addrman.locations.contains_key(&info.addr) {
                addrman.locations.insert(info.addr, (Table::Tried, slot));
                addrman.tried[slot] = Some(info);
            }
        }
        addrman
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: u8, b: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 20, a, b], port))
    }

    #[test]
    fn add_and_lookup() {
        let mut am = AddrMan::with_key([7; 16]);
        assert!(am.add(addr(1, 1, 9590), 1, 1000));
        assert!(!am.add(addr(1, 1, 9590), 1, 2000)); // refresh, not insert
        assert_eq!(am.len(), 1);
        assert_eq!(am.get(&addr(1, 1, 9590)).unwrap().last_seen, 2000);
    }

    #[test]
    fn rejects_unroutable() {
        let mut am = AddrMan::new();
        assert!(!am.add("0.0.0.0:9590".parse().unwrap(), 1, 1000));
        assert!(!am.add(addr(1, 1, 0), 1, 1000));
    }

    #[test]
    fn mark_good_promotes_to_tried() {
        let mut am = AddrMan::with_key([7; 16]);
        let a = addr(2, 2, 9590);
        am.add(a, 1, unix_now());
        am.mark_good(&a);
        let snapshot = am.snapshot();
        assert_eq!(snapshot.tried.len(), 1);
        assert!(snapshot.new.is_empty());
    }

    #[test]
    fn selection_prefers_tried() {
        let mut am = AddrMan::with_key([7; 16]);
        let good = addr(3, 3, 9590);
        am.add(good, 1, unix_now());
        am.mark_good(&good);
        for i in 0..20 {
            am.add(addr(4, i, 9590), 1, unix_now());
        }
        let mut rng = rand::thread_rng();
        let mut tried_hits = 0;
        for _ in 0..200 {
            if am.select(&mut rng).unwrap().addr == good {
                tried_hits += 1;
            }
        }
        // ~80% bias: statistically far above the 1-in-21 uniform rate
        assert!(tried_hits > 100, "tried selected only {tried_hits}/200");
    }

    #[test]
    fn terrible_addresses_skipped() {
        let mut am = AddrMan::with_key([7; 16]);
        let bad = addr(5, 5, 9590);
        am.add(bad, 1, unix_now());
        for _ in 0..ADDRMAN_MAX_FAILURES {
            am.mark_attempt(&bad);
        }
        let mut rng = rand::thread_rng();
        assert!(am.select(&mut rng).is_none());
        assert!(am.sample(10, &mut rng).is_empty());
    }

    #[test]
    fn sample_caps_output() {
        let mut am = AddrMan::with_key([7; 16]);
        let now = unix_now();
        for i in 0..50u8 {
            for j in 0..5u8 {
                am.add(addr(i, j, 9590), 1, now);
            }
        }
        let mut rng = rand::thread_rng();
        assert!(am.sample(100, &mut rng).len() <= 100);
        assert!(!am.sample(100, &mut rng).is_empty());
    }

    #[test]
    fn snapshot_roundtrip_keeps_tables() {
        let mut am = AddrMan::with_key([9; 16]);
        let now = unix_now();
        let tried_addr = addr(6, 6, 9590);
        am.add(tried_addr, 1, now);
        am.mark_good(&tried_addr);
        am.add(addr(7, 7, 9590), 1, now);

        let restored = AddrMan::from_snapshot(am.snapshot());
        assert_eq!(restored.len(), 2);
        let snap = restored.snapshot();
        assert_eq!(snap.tried.len(), 1);
        assert_eq!(snap.new.len(), 1);
        assert_eq!(snap.tried[0].addr, tried_addr);
    }

    #[test]
    fn bucket_assignment_is_key_deterministic() {
        let am1 = AddrMan::with_key([1; 16]);
        let am2 = AddrMan::with_key([1; 16]);
        let am3 = AddrMan::with_key([2; 16]);
        let a = addr(8, 8, 9590);
        assert_eq!(am1.slot_for(Table::New, &a), am2.slot_for(Table::New, &a));
        // different keys nearly always land elsewhere; just check it is
        // a function of the key for this fixed input
        let _ = am3.slot_for(Table::New, &a);
    }
}
