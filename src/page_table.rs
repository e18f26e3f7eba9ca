use log::{debug, warn};
use simple_error::bail;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::allocator::{self, Region};
use crate::clock_ring::{ClockRing, NO_SLOT};
use crate::config::{ClientConfig, ServerConfig};
use crate::message::Operation;
use crate::metrics::Metrics;
use crate::result::Result;
use crate::tier::{Tier, TierInfo, TIER_COUNT};

/// Snapshot of one page's metadata. The fields are read individually with
/// relaxed ordering; the tuple is eventually consistent, which is all the
/// scanner needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMeta {
    pub tier: Tier,
    pub last_access_ms: u64,
    pub access_count: u64,
}

/// Per-page metadata. All fields are atomics so the access path, the
/// scanner and the metrics reader can touch them without a lock. `tier`
/// pairs a release store (migrate) with acquire loads so that a reader
/// observing the new tier also observes everything written before the
/// move.
struct PageEntry {
    address: AtomicUsize,
    tier: AtomicU8,
    last_access_ms: AtomicU64,
    access_count: AtomicU64,
    clock_slot: AtomicUsize,
}

impl PageEntry {
    fn new(address: usize, tier: Tier, now_ms: u64) -> PageEntry {
        PageEntry {
            address: AtomicUsize::new(address),
            tier: AtomicU8::new(tier as u8),
            last_access_ms: AtomicU64::new(now_ms),
            access_count: AtomicU64::new(0),
            clock_slot: AtomicUsize::new(NO_SLOT),
        }
    }

    fn tier(&self) -> Tier {
        Tier::from_u8(self.tier.load(Ordering::Acquire))
    }
}

/// Owns every page entry and every tier's backing region. Entries are
/// created once at init and only their metadata mutates afterwards;
/// backing memory is released when the table drops.
pub struct PageTable {
    entries: Box<[PageEntry]>,
    regions: [Region; TIER_COUNT],
    tiers: [TierInfo; TIER_COUNT],
    num_tiers: usize,
    cursor: AtomicUsize,
    cache_ring: Option<ClockRing>,
    metrics: Arc<Metrics>,
}

impl PageTable {
    /// Allocate the tier regions and populate one entry per requested page,
    /// in per-client tier order (a client's LOCAL pages, then REMOTE, then
    /// PMEM). Fatal when a region cannot be mapped or a tier is
    /// oversubscribed.
    pub fn init(
        clients: &[ClientConfig],
        server: &ServerConfig,
        enable_cache_ring: bool,
        metrics: Arc<Metrics>,
    ) -> Result<PageTable> {
        let num_tiers = server.num_tiers;
        let mut loads = [0usize; TIER_COUNT];
        for client in clients {
            for tier in Tier::all() {
                loads[tier.index()] += client.pages_in(tier, num_tiers);
            }
        }
        let total_pages: usize = loads.iter().sum();
        if total_pages == 0 {
            bail!("no pages requested");
        }
        for tier in Tier::all() {
            if loads[tier.index()] > server.capacity(tier) {
                bail!("memory allocation exceeds {} limit", tier);
            }
        }
        debug!(
            "page loads: local {} remote {} pmem {} (total {})",
            loads[0], loads[1], loads[2], total_pages
        );

        let local = if num_tiers == 2 {
            allocator::allocate_local(loads[0])?
        } else {
            allocator::allocate_bound(loads[0], Tier::Local.numa_node())?
        };
        let remote = allocator::allocate_bound(loads[1], Tier::Remote.numa_node())?;
        let pmem = allocator::allocate_bound(loads[2], Tier::Pmem.numa_node())?;
        let regions = [local, remote, pmem];
        for region in &regions {
            allocator::fill_random(region);
        }

        let now = allocator::now_ms();
        let mut offsets = [0usize; TIER_COUNT];
        let mut entries = Vec::with_capacity(total_pages);
        for client in clients {
            for tier in Tier::all() {
                let count = client.pages_in(tier, num_tiers);
                let region = &regions[tier.index()];
                for _ in 0..count {
                    let addr = region.page_addr(offsets[tier.index()]);
                    offsets[tier.index()] += 1;
                    entries.push(PageEntry::new(addr, tier, now));
                }
            }
        }

        let tiers = [
            TierInfo::new(Tier::Local, server.capacity(Tier::Local)),
            TierInfo::new(Tier::Remote, server.capacity(Tier::Remote)),
            TierInfo::new(Tier::Pmem, server.capacity(Tier::Pmem)),
        ];
        for tier in Tier::all() {
            tiers[tier.index()].set_occupancy(loads[tier.index()]);
        }

        let cache_ring = if enable_cache_ring {
            let ring = ClockRing::new(server.capacity(Tier::Local));
            for (page_id, entry) in entries.iter().enumerate() {
                if entry.tier() == Tier::Local {
                    if let Some(slot) = ring.insert(page_id) {
                        entry.clock_slot.store(slot, Ordering::Relaxed);
                    }
                }
            }
            Some(ring)
        } else {
            None
        };

        Ok(PageTable {
            entries: entries.into_boxed_slice(),
            regions,
            tiers,
            num_tiers,
            cursor: AtomicUsize::new(0),
            cache_ring,
            metrics,
        })
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn num_tiers(&self) -> usize {
        self.num_tiers
    }

    pub fn has_cache_ring(&self) -> bool {
        self.cache_ring.is_some()
    }

    pub fn occupancies(&self) -> [usize; TIER_COUNT] {
        [
            self.tiers[0].occupancy(),
            self.tiers[1].occupancy(),
            self.tiers[2].occupancy(),
        ]
    }

    pub fn tier_occupancy(&self, tier: Tier) -> usize {
        self.tiers[tier.index()].occupancy()
    }

    pub fn tier_capacity(&self, tier: Tier) -> usize {
        self.tiers[tier.index()].capacity
    }

    /// Metadata snapshot. An out-of-range id indicates an upstream bug; it
    /// is logged and answered with a zeroed tuple.
    pub fn get_metadata(&self, page_id: usize) -> PageMeta {
        match self.entries.get(page_id) {
            Some(entry) => PageMeta {
                tier: entry.tier(),
                last_access_ms: entry.last_access_ms.load(Ordering::Relaxed),
                access_count: entry.access_count.load(Ordering::Relaxed),
            },
            None => {
                warn!(
                    "metadata request for page {} outside [0, {})",
                    page_id,
                    self.entries.len()
                );
                PageMeta {
                    tier: Tier::Local,
                    last_access_ms: 0,
                    access_count: 0,
                }
            }
        }
    }

    /// Perform the timed physical access and update metadata and metrics.
    /// The address may race with a concurrent migration; the cost is one
    /// latency sample attributed to the wrong tier.
    pub fn access(&self, page_id: usize, op: Operation) {
        let entry = match self.entries.get(page_id) {
            Some(entry) => entry,
            None => {
                warn!(
                    "access to page {} outside [0, {})",
                    page_id,
                    self.entries.len()
                );
                return;
            }
        };
        let tier = entry.tier();
        let addr = entry.address.load(Ordering::Relaxed);
        let latency_ns = allocator::timed_access(addr, op);
        entry
            .last_access_ms
            .store(allocator::now_ms(), Ordering::Relaxed);
        entry.access_count.fetch_add(1, Ordering::Relaxed);
        if let Some(ring) = &self.cache_ring {
            if tier == Tier::Local {
                let slot = entry.clock_slot.load(Ordering::Relaxed);
                if slot != NO_SLOT {
                    ring.mark_referenced(slot);
                }
            }
        }
        self.metrics.record_access(tier, latency_ns);
    }

    /// Move one page to `target`. Only the scanner calls this, so
    /// migrations are serialized. Returns whether the page actually moved:
    /// moving to the current tier, to a full tier, with a bad id, or
    /// against an OS refusal all leave the entry untouched.
    pub fn migrate(&self, page_id: usize, target: Tier) -> bool {
        let entry = match self.entries.get(page_id) {
            Some(entry) => entry,
            None => {
                warn!(
                    "migration of page {} outside [0, {})",
                    page_id,
                    self.entries.len()
                );
                return false;
            }
        };
        let current = entry.tier();
        if current == target {
            return false;
        }
        if self.tiers[target.index()].is_full() {
            debug!(
                "migration target {} full ({}/{} pages)",
                target,
                self.tiers[target.index()].occupancy(),
                self.tiers[target.index()].capacity
            );
            return false;
        }
        let addr = entry.address.load(Ordering::Relaxed);
        if let Err(e) = allocator::migrate_page(addr, target) {
            warn!("cannot migrate page {} to {}: {}", page_id, target, e);
            return false;
        }

        // the virtual address is preserved by the move; publish the tier
        // with release so readers see a consistent entry
        entry.tier.store(target as u8, Ordering::Release);
        entry
            .last_access_ms
            .store(allocator::now_ms(), Ordering::Relaxed);
        entry.access_count.store(0, Ordering::Relaxed);
        self.tiers[current.index()].page_moved_out();
        self.tiers[target.index()].page_moved_in();

        if let Some(ring) = &self.cache_ring {
            if current == Tier::Local {
                let slot = entry.clock_slot.swap(NO_SLOT, Ordering::Relaxed);
                if slot != NO_SLOT {
                    ring.remove(slot);
                }
            }
            if target == Tier::Local {
                match ring.insert(page_id) {
                    Some(slot) => entry.clock_slot.store(slot, Ordering::Relaxed),
                    None => warn!("cache ring full, page {} not tracked", page_id),
                }
            }
        }

        self.metrics.record_migration(current, target);
        debug!("migrated page {} from {} to {}", page_id, current, target);
        true
    }

    /// Round-robin scan cursor. Single consumer (the scanner task).
    pub fn scan_next(&self) -> usize {
        let cursor = self.cursor.load(Ordering::Relaxed);
        self.cursor
            .store((cursor + 1) % self.entries.len(), Ordering::Relaxed);
        cursor
    }

    /// Best-effort huge-page promotion of every tier region.
    pub fn promote_huge_all(&self) {
        for region in &self.regions {
            allocator::promote_huge(region);
        }
    }

    /// Pop the cache ring's eviction candidate, detaching it from the ring.
    pub fn evict_candidate(&self) -> Option<usize> {
        let ring = self.cache_ring.as_ref()?;
        let page_id = ring.find_victim()?;
        if let Some(entry) = self.entries.get(page_id) {
            entry.clock_slot.store(NO_SLOT, Ordering::Relaxed);
        }
        Some(page_id)
    }

    /// Put a previously popped candidate back, used when its demotion was
    /// rejected and the page stays in the cache tier.
    pub fn readmit(&self, page_id: usize) {
        let ring = match &self.cache_ring {
            Some(ring) => ring,
            None => return,
        };
        if let Some(entry) = self.entries.get(page_id) {
            if entry.tier() == Tier::Local && entry.clock_slot.load(Ordering::Relaxed) == NO_SLOT {
                if let Some(slot) = ring.insert(page_id) {
                    entry.clock_slot.store(slot, Ordering::Relaxed);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn cache_ring_len(&self) -> usize {
        self.cache_ring.as_ref().map_or(0, |r| r.len())
    }
}
