use log::debug;
use std::time::Duration;

use crate::allocator;
use crate::message::MigrationDecision;
use crate::page_table::PageTable;
use crate::policy::{PageStatus, Policy};
use crate::shutdown::Shutdown;
use crate::tier::Tier;

/// Periodically walks the whole page table, classifies every page and asks
/// the table for the migrations the promotion/demotion matrix calls for.
/// Exactly one scanner may run: it is the single writer of occupancy
/// counters and the only source of migrations.
#[derive(Clone)]
pub struct Scanner {
    policy: Policy,
    scan_interval: Duration,
    num_tiers: usize,
}

impl Scanner {
    pub fn new(policy: Policy, scan_interval: Duration, num_tiers: usize) -> Scanner {
        Scanner {
            policy,
            scan_interval,
            num_tiers,
        }
    }

    /// Drive the scan loop until shutdown. Sleeps only when the cursor
    /// wraps; within a sweep the loop stays hot so shutdown is observed
    /// within one iteration.
    pub fn run(&self, table: &PageTable, shutdown: &Shutdown) {
        while !shutdown.is_set() {
            let page_id = table.scan_next();
            let meta = table.get_metadata(page_id);
            let status =
                self.policy
                    .classify(allocator::now_ms(), meta.last_access_ms, meta.access_count);
            self.apply(table, page_id, meta.tier, status);

            if page_id == table.size() - 1 {
                debug!("finished scanning all pages in one round");
                table.promote_huge_all();
                shutdown.wait_timeout(self.scan_interval);
            }
        }
        debug!("scanner exiting");
    }

    /// The promotion/demotion matrix as a pure function: which migration
    /// does this (tier, status) pair call for, if any.
    fn decide(&self, page_id: usize, tier: Tier, status: PageStatus) -> Option<MigrationDecision> {
        let target_tier = match (tier, status) {
            (Tier::Local, PageStatus::Cold) => {
                if self.num_tiers == 2 {
                    Tier::Pmem
                } else {
                    Tier::Remote
                }
            }
            (Tier::Remote, PageStatus::Cold) => Tier::Pmem,
            (Tier::Remote, PageStatus::Hot) | (Tier::Pmem, PageStatus::Hot) => Tier::Local,
            // warm PMEM pages move up one step, without evicting anyone
            (Tier::Pmem, PageStatus::Warm) => {
                if self.num_tiers == 2 {
                    Tier::Local
                } else {
                    Tier::Remote
                }
            }
            _ => return None,
        };
        Some(MigrationDecision {
            page_id,
            target_tier,
        })
    }

    /// Execute one decision. The page table may still reject it on capacity
    /// grounds.
    fn apply(&self, table: &PageTable, page_id: usize, tier: Tier, status: PageStatus) {
        let decision = match self.decide(page_id, tier, status) {
            Some(decision) => decision,
            None => return,
        };
        debug!("{:?} page in {}: {}", status, tier, decision);
        if decision.target_tier == Tier::Local && status == PageStatus::Hot {
            self.promote_to_local(table, decision.page_id);
        } else {
            table.migrate(decision.page_id, decision.target_tier);
        }
    }

    /// Promote a hot page into LOCAL. When LOCAL is full and the cache ring
    /// is available, demote the ring's victim one tier down and retry once.
    fn promote_to_local(&self, table: &PageTable, page_id: usize) {
        if table.migrate(page_id, Tier::Local) {
            return;
        }
        if !table.has_cache_ring() || !local_is_full(table) {
            return;
        }
        let victim = match table.evict_candidate() {
            Some(victim) => victim,
            None => return,
        };
        let demote_to = if self.num_tiers == 2 {
            Tier::Pmem
        } else {
            Tier::Remote
        };
        debug!("evicting page {} from LOCAL for page {}", victim, page_id);
        if table.migrate(victim, demote_to) {
            table.migrate(page_id, Tier::Local);
        } else {
            // victim could not leave; put it back under CLOCK tracking
            table.readmit(victim);
        }
    }
}

fn local_is_full(table: &PageTable) -> bool {
    table.tier_occupancy(Tier::Local) >= table.tier_capacity(Tier::Local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, Pattern, ServerConfig};
    use crate::message::Operation;
    use crate::metrics::{Metrics, DEFAULT_QUANTILES};
    use std::sync::Arc;

    fn table_with(
        tier_sizes: Vec<usize>,
        capacities: [usize; 3],
        cache_ring: bool,
    ) -> (PageTable, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new(&DEFAULT_QUANTILES));
        let clients = vec![ClientConfig {
            pattern: Pattern::Uniform,
            tier_sizes,
        }];
        let server = ServerConfig {
            num_tiers: 3,
            capacities,
        };
        let table = PageTable::init(&clients, &server, cache_ring, Arc::clone(&metrics))
            .expect("init failed");
        (table, metrics)
    }

    fn scanner(num_tiers: usize) -> Scanner {
        Scanner::new(
            Policy::Frequency {
                hot_count: 3,
                cold_count: 0,
            },
            Duration::from_secs(60),
            num_tiers,
        )
    }

    #[test]
    fn hot_pmem_page_is_promoted() {
        let (table, metrics) = table_with(vec![0, 0, 1], [10, 10, 10], false);
        for _ in 0..5 {
            table.access(0, Operation::Read);
        }
        let meta = table.get_metadata(0);
        let status = scanner(3).policy.classify(0, meta.last_access_ms, meta.access_count);
        assert_eq!(status, PageStatus::Hot);
        scanner(3).apply(&table, 0, Tier::Pmem, PageStatus::Hot);
        assert_eq!(table.get_metadata(0).tier, Tier::Local);
        assert_eq!(metrics.snapshot().pmem_to_local, 1);
    }

    #[test]
    fn cold_local_page_is_demoted() {
        let (table, metrics) = table_with(vec![1, 0, 0], [10, 10, 10], false);
        scanner(3).apply(&table, 0, Tier::Local, PageStatus::Cold);
        assert_eq!(table.get_metadata(0).tier, Tier::Remote);
        assert_eq!(metrics.snapshot().local_to_remote, 1);
    }

    #[test]
    fn two_tier_demotion_skips_remote() {
        let (table, metrics) = table_with(vec![1, 0, 0], [10, 10, 10], false);
        scanner(2).apply(&table, 0, Tier::Local, PageStatus::Cold);
        assert_eq!(table.get_metadata(0).tier, Tier::Pmem);
        assert_eq!(metrics.snapshot().local_to_pmem, 1);
        assert_eq!(metrics.snapshot().local_to_remote, 0);
    }

    #[test]
    fn warm_pmem_page_moves_one_step() {
        let (table, _) = table_with(vec![0, 0, 2], [10, 10, 10], false);
        scanner(3).apply(&table, 0, Tier::Pmem, PageStatus::Warm);
        assert_eq!(table.get_metadata(0).tier, Tier::Remote);
        scanner(2).apply(&table, 1, Tier::Pmem, PageStatus::Warm);
        assert_eq!(table.get_metadata(1).tier, Tier::Local);
    }

    #[test]
    fn warm_and_hot_local_pages_stay() {
        let (table, metrics) = table_with(vec![1, 0, 0], [10, 10, 10], false);
        scanner(3).apply(&table, 0, Tier::Local, PageStatus::Hot);
        scanner(3).apply(&table, 0, Tier::Local, PageStatus::Warm);
        assert_eq!(table.get_metadata(0).tier, Tier::Local);
        assert_eq!(metrics.snapshot().total_migrations(), 0);
    }

    #[test]
    fn cold_pmem_page_stays() {
        let (table, metrics) = table_with(vec![0, 0, 1], [10, 10, 10], false);
        scanner(3).apply(&table, 0, Tier::Pmem, PageStatus::Cold);
        assert_eq!(table.get_metadata(0).tier, Tier::Pmem);
        assert_eq!(metrics.snapshot().total_migrations(), 0);
    }

    #[test]
    fn promotion_against_full_local_without_ring_is_rejected() {
        let (table, metrics) = table_with(vec![2, 0, 1], [2, 10, 10], false);
        scanner(3).apply(&table, 2, Tier::Pmem, PageStatus::Hot);
        assert_eq!(table.get_metadata(2).tier, Tier::Pmem);
        assert_eq!(metrics.snapshot().total_migrations(), 0);
    }

    #[test]
    fn promotion_against_full_local_evicts_via_ring() {
        let (table, metrics) = table_with(vec![2, 0, 1], [2, 10, 10], true);
        scanner(3).apply(&table, 2, Tier::Pmem, PageStatus::Hot);
        // one LOCAL page was demoted to make room, then the hot page moved in
        assert_eq!(table.get_metadata(2).tier, Tier::Local);
        assert_eq!(table.tier_occupancy(Tier::Local), 2);
        assert_eq!(metrics.snapshot().local_to_remote, 1);
        assert_eq!(metrics.snapshot().pmem_to_local, 1);
        // the ring tracks the new resident
        assert_eq!(table.cache_ring_len(), 2);
    }

    #[test]
    fn scan_loop_stops_on_shutdown() {
        let (table, _) = table_with(vec![2, 0, 0], [10, 10, 10], false);
        let shutdown = Shutdown::new();
        shutdown.signal();
        // must return immediately without sleeping the scan interval
        scanner(3).run(&table, &shutdown);
    }
}
