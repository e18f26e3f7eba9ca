use std::fmt;

use crate::tier::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    /// In-band end-of-stream marker; never performs a memory access.
    End,
}

/// One request from a workload client. `page_offset` is relative to the
/// client's own address space; the server translates it to a global page
/// id via per-client base offsets fixed at init.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest {
    pub client_id: usize,
    pub page_offset: usize,
    pub op: Operation,
}

impl fmt::Display for AccessRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let op = match self.op {
            Operation::Read => "READ",
            Operation::Write => "WRITE",
            Operation::End => "END",
        };
        write!(
            f,
            "client {}, offset {}, operation {}",
            self.client_id, self.page_offset, op
        )
    }
}

/// Produced by the scanner, consumed immediately by the page table's
/// migrate; never queued.
#[derive(Debug, Clone, Copy)]
pub struct MigrationDecision {
    pub page_id: usize,
    pub target_tier: Tier,
}

impl fmt::Display for MigrationDecision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "page {} to {}", self.page_id, self.target_tier)
    }
}
