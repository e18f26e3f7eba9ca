use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A physical memory class with its own latency. LOCAL and REMOTE are the
/// two NUMA DRAM nodes, PMEM the persistent-memory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tier {
    Local = 0,
    Remote = 1,
    Pmem = 2,
}

pub const TIER_COUNT: usize = 3;

impl Tier {
    /// Physical NUMA node this tier is pinned to. With two tiers LOCAL is
    /// left unbound and covers the union of nodes 0 and 1.
    pub fn numa_node(self) -> i32 {
        self as i32
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(v: u8) -> Tier {
        match v {
            0 => Tier::Local,
            1 => Tier::Remote,
            _ => Tier::Pmem,
        }
    }

    pub fn all() -> [Tier; TIER_COUNT] {
        [Tier::Local, Tier::Remote, Tier::Pmem]
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Tier::Local => "LOCAL",
            Tier::Remote => "REMOTE",
            Tier::Pmem => "PMEM",
        };
        write!(f, "{}", name)
    }
}

/// Capacity and current page count of one tier. Occupancy has a single
/// writer (the scanner via migrate, plus init); other threads read it with
/// relaxed loads and may observe slightly stale values.
pub struct TierInfo {
    pub tier: Tier,
    pub capacity: usize,
    occupancy: AtomicUsize,
}

impl TierInfo {
    pub fn new(tier: Tier, capacity: usize) -> TierInfo {
        TierInfo {
            tier,
            capacity,
            occupancy: AtomicUsize::new(0),
        }
    }

    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        self.occupancy() >= self.capacity
    }

    pub fn set_occupancy(&self, pages: usize) {
        self.occupancy.store(pages, Ordering::Relaxed);
    }

    pub fn page_moved_in(&self) {
        self.occupancy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_moved_out(&self) {
        self.occupancy.fetch_sub(1, Ordering::Relaxed);
    }
}
