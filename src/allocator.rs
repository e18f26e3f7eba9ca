use libc::{c_int, c_long, c_void};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::mman::{madvise, mmap, munmap, MapFlags, MmapAdvise, ProtFlags};
use rand::RngCore;
use simple_error::{bail, try_with};
use std::ptr;
use std::sync::Once;

use crate::message::Operation;
use crate::page_math::{pages_to_bytes, PAGE_SIZE};
use crate::result::Result;
use crate::tier::Tier;

// from linux/mempolicy.h; not exported by the libc crate
const MPOL_BIND: c_int = 2;
const MPOL_MF_MOVE: c_int = 1 << 1;

static OFFLINE_NODE_WARNING: Once = Once::new();

/// Monotonic nanosecond clock, the time base for every latency sample.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Monotonic milliseconds, the resolution of page-access timestamps.
pub fn now_ms() -> u64 {
    now_ns() / 1_000_000
}

/// A page-aligned anonymous mapping backing one tier. Unmapped on drop on
/// every exit path.
pub struct Region {
    base: *mut u8,
    len: usize,
}

// The region is plain anonymous memory; all access synchronization happens
// in the page table's atomic metadata.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn empty() -> Region {
        Region {
            base: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn base(&self) -> usize {
        self.base as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pages(&self) -> usize {
        self.len / PAGE_SIZE
    }

    /// Virtual address of the idx-th page in this region.
    pub fn page_addr(&self, idx: usize) -> usize {
        debug_assert!(idx < self.pages());
        self.base as usize + idx * PAGE_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        !self.is_empty() && base <= addr && addr < base + self.len
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        if let Err(e) = unsafe { munmap(self.base as *mut c_void, self.len) } {
            warn!("failed to unmap tier region at {:p}: {}", self.base, e);
        }
    }
}

/// Allocate `page_count` pages without binding them to a node. Used for the
/// LOCAL tier in the two-tier topology, where DRAM covers nodes 0 and 1.
pub fn allocate_local(page_count: usize) -> Result<Region> {
    if page_count == 0 {
        return Ok(Region::empty());
    }
    let len = pages_to_bytes(page_count);
    let base = try_with!(
        unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_POPULATE,
                -1,
                0,
            )
        },
        "cannot allocate {} pages",
        page_count
    );
    Ok(Region {
        base: base as *mut u8,
        len,
    })
}

/// Allocate `page_count` pages and bind them to `numa_node`. Binding and
/// the post-hoc residency check are best-effort: pages that land on another
/// node are reported, never fatal. Only the mapping itself can fail.
pub fn allocate_bound(page_count: usize, numa_node: i32) -> Result<Region> {
    if page_count == 0 {
        return Ok(Region::empty());
    }
    let len = pages_to_bytes(page_count);
    let base = try_with!(
        unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        },
        "cannot allocate {} pages for node {}",
        page_count,
        numa_node
    );
    let region = Region {
        base: base as *mut u8,
        len,
    };

    let nodemask: u64 = 1 << numa_node;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            region.base as *mut c_void,
            len,
            MPOL_BIND,
            &nodemask as *const u64,
            64usize,
            0usize,
        )
    };
    if rc < 0 {
        warn_offline_node(numa_node, Errno::last());
    }

    // Fault every page in while the bind policy is active.
    for i in 0..page_count {
        unsafe { ptr::write_volatile(region.page_addr(i) as *mut u8, 0) };
    }

    let misplaced = count_misplaced_pages(&region, numa_node);
    if misplaced > 0 {
        warn!(
            "{} of {} pages did not land on node {}",
            misplaced, page_count, numa_node
        );
    }
    Ok(region)
}

/// Query actual residency of every page via move_pages and count the pages
/// that are not on `numa_node`.
fn count_misplaced_pages(region: &Region, numa_node: i32) -> usize {
    let page_count = region.pages();
    let pages: Vec<*mut c_void> = (0..page_count)
        .map(|i| region.page_addr(i) as *mut c_void)
        .collect();
    let mut status: Vec<c_int> = vec![0; page_count];
    let rc = unsafe {
        libc::syscall(
            libc::SYS_move_pages,
            0,
            page_count,
            pages.as_ptr(),
            ptr::null::<c_int>(),
            status.as_mut_ptr(),
            0,
        )
    };
    if rc < 0 {
        debug!("cannot query page residency: {}", Errno::last());
        return 0;
    }
    status.iter().filter(|&&s| s != numa_node).count()
}

/// Relocate a single page to the target tier's node. The virtual address is
/// preserved; only the physical frame moves. A per-page failure is logged
/// and swallowed; an offline target node degrades to a logical move with a
/// one-time warning. Anything else is an outright refusal reported to the
/// caller, which leaves the page entry untouched.
pub fn migrate_page(addr: usize, target: Tier) -> Result<()> {
    let page: *mut c_void = addr as *mut c_void;
    let node: c_int = target.numa_node();
    let mut status: c_int = 0;
    let rc: c_long = unsafe {
        libc::syscall(
            libc::SYS_move_pages,
            0,
            1usize,
            &page as *const *mut c_void,
            &node as *const c_int,
            &mut status as *mut c_int,
            MPOL_MF_MOVE,
        )
    };
    if rc < 0 {
        let err = Errno::last();
        match err {
            Errno::ENODEV | Errno::EINVAL | Errno::ENOSYS => {
                warn_offline_node(node, err);
                return Ok(());
            }
            _ => bail!("move_pages to node {} refused: {}", node, err),
        }
    }
    if status < 0 {
        debug!(
            "page at {:#x} was not moved to node {} (status {})",
            addr, node, status
        );
    }
    Ok(())
}

fn warn_offline_node(node: i32, err: Errno) {
    OFFLINE_NODE_WARNING.call_once(|| {
        warn!(
            "node {} is not available ({}); pages stay where they are and \
             tier placement becomes logical only",
            node, err
        );
    });
}

/// Advise the kernel to back the region with huge pages. Best-effort.
pub fn promote_huge(region: &Region) {
    if region.is_empty() {
        return;
    }
    if let Err(e) = unsafe {
        madvise(
            region.base as *mut c_void,
            region.len,
            MmapAdvise::MADV_HUGEPAGE,
        )
    } {
        debug!("huge page advice for region {:p} failed: {}", region.base, e);
    }
}

/// Fill the whole region with random bytes so accesses hit initialized,
/// non-zero-page memory.
pub fn fill_random(region: &Region) {
    if region.is_empty() {
        return;
    }
    let slice = unsafe { std::slice::from_raw_parts_mut(region.base, region.len) };
    rand::thread_rng().fill_bytes(slice);
}

#[cfg(target_arch = "x86_64")]
fn flush_cache(addr: usize) {
    unsafe { core::arch::x86_64::_mm_clflush(addr as *const u8) };
}

#[cfg(not(target_arch = "x86_64"))]
fn flush_cache(_addr: usize) {}

/// Flush the cache line and perform one volatile read or write of the first
/// word of the page. Returns elapsed nanoseconds. The caller guarantees the
/// address points into a live region.
pub fn timed_access(addr: usize, op: Operation) -> u64 {
    flush_cache(addr);
    let word = addr as *mut u64;
    let start = now_ns();
    match op {
        Operation::Read => {
            unsafe { ptr::read_volatile(word) };
        }
        _ => {
            unsafe { ptr::write_volatile(word, 44) };
        }
    }
    now_ns() - start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_allocation() {
        let region = allocate_local(4).expect("allocation failed");
        assert_eq!(region.pages(), 4);
        assert!(region.contains(region.page_addr(3)));
        assert!(!region.contains(region.base() + region.len()));
    }

    #[test]
    fn empty_region() {
        let region = allocate_local(0).expect("allocation failed");
        assert!(region.is_empty());
        assert!(!region.contains(0));
    }

    #[test]
    fn bound_allocation_never_fails_on_missing_node() {
        // node 7 will not exist on most machines; the bind must degrade to
        // a warning, not an error
        let region = allocate_bound(2, 7).expect("allocation failed");
        assert_eq!(region.pages(), 2);
    }

    #[test]
    fn timed_access_measures() {
        let region = allocate_local(1).expect("allocation failed");
        fill_random(&region);
        let read = timed_access(region.page_addr(0), Operation::Read);
        let write = timed_access(region.page_addr(0), Operation::Write);
        // both paths executed; the clock is monotonic so any value is legal,
        // but two back-to-back samples must not be absurdly large
        assert!(read < 1_000_000_000);
        assert!(write < 1_000_000_000);
    }

    #[test]
    fn clock_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
        assert!(now_ms() >= a / 1_000_000);
    }

    #[test]
    fn migrate_to_offline_node_is_logical() {
        let region = allocate_local(1).expect("allocation failed");
        // either the node exists and the page moves, or the node is offline
        // and the move degrades; both are Ok
        migrate_page(region.page_addr(0), Tier::Remote).expect("migration refused");
    }
}
