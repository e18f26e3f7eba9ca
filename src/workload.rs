use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::config::Pattern;
use crate::message::{AccessRequest, Operation};
use crate::ring_buffer::{RingBuffer, BACKOFF};
use crate::shutdown::Shutdown;

/// Produces page offsets within one client's address space according to
/// the configured distribution.
pub struct AccessGenerator {
    pattern: Pattern,
    pages: usize,
    rng: StdRng,
    /// Cumulative zipf distribution over ranks, built once.
    zipf_cdf: Vec<f64>,
}

impl AccessGenerator {
    pub fn new(pattern: Pattern, pages: usize, zipf_skew: f64) -> AccessGenerator {
        Self::with_rng(pattern, pages, zipf_skew, StdRng::from_entropy())
    }

    /// Deterministic variant for reproducible runs and tests.
    pub fn seeded(pattern: Pattern, pages: usize, zipf_skew: f64, seed: u64) -> AccessGenerator {
        Self::with_rng(pattern, pages, zipf_skew, StdRng::seed_from_u64(seed))
    }

    fn with_rng(pattern: Pattern, pages: usize, zipf_skew: f64, rng: StdRng) -> AccessGenerator {
        assert!(pages > 0, "generator needs at least one page");
        let zipf_cdf = if pattern == Pattern::Zipfian {
            zipf_cdf(pages, zipf_skew)
        } else {
            Vec::new()
        };
        AccessGenerator {
            pattern,
            pages,
            rng,
            zipf_cdf,
        }
    }

    /// Next page offset in `[0, pages)`.
    pub fn next_offset(&mut self) -> usize {
        match self.pattern {
            Pattern::Uniform => self.rng.gen_range(0..self.pages),
            Pattern::Hot => self.skewed_offset(),
            Pattern::Zipfian => self.zipf_offset(),
        }
    }

    /// 70% of accesses to the first 10% of pages, 20% to the next 20%,
    /// 10% to the remaining 70%.
    fn skewed_offset(&mut self) -> usize {
        let hot_end = (self.pages / 10).max(1).min(self.pages);
        let warm_end = (self.pages * 3 / 10).max(hot_end + 1).min(self.pages);
        let dice: f64 = self.rng.gen();
        if dice < 0.7 || hot_end == self.pages {
            self.rng.gen_range(0..hot_end)
        } else if dice < 0.9 || warm_end == self.pages {
            self.rng.gen_range(hot_end..warm_end)
        } else {
            self.rng.gen_range(warm_end..self.pages)
        }
    }

    fn zipf_offset(&mut self) -> usize {
        let dice: f64 = self.rng.gen();
        match self
            .zipf_cdf
            .binary_search_by(|p| p.partial_cmp(&dice).unwrap_or(std::cmp::Ordering::Less))
        {
            Ok(rank) | Err(rank) => rank.min(self.pages - 1),
        }
    }

    /// Read with probability `read_ratio`, write otherwise.
    pub fn next_op(&mut self, read_ratio: f64) -> Operation {
        if self.rng.gen::<f64>() < read_ratio {
            Operation::Read
        } else {
            Operation::Write
        }
    }
}

/// Cumulative probabilities of a zipf(s) distribution: offset i is rank
/// i+1 and P(rank k) is proportional to 1 / k^s.
fn zipf_cdf(pages: usize, skew: f64) -> Vec<f64> {
    let mut weights: Vec<f64> = (1..=pages).map(|k| 1.0 / (k as f64).powf(skew)).collect();
    let total: f64 = weights.iter().sum();
    let mut acc = 0.0;
    for w in weights.iter_mut() {
        acc += *w / total;
        *w = acc;
    }
    weights
}

/// One synthetic workload producer. Pushes requests for `running_time`,
/// then a single END marker, spinning with the ring-buffer backoff when
/// the queue is full.
pub struct Client {
    pub id: usize,
    generator: AccessGenerator,
    read_ratio: f64,
    running_time: Duration,
}

impl Client {
    pub fn new(
        id: usize,
        pattern: Pattern,
        pages: usize,
        zipf_skew: f64,
        read_ratio: f64,
        running_time: Duration,
    ) -> Client {
        Client {
            id,
            generator: AccessGenerator::new(pattern, pages, zipf_skew),
            read_ratio,
            running_time,
        }
    }

    /// Returns the number of access requests pushed (END excluded).
    pub fn run(&mut self, buffer: &RingBuffer<AccessRequest>, shutdown: &Shutdown) -> u64 {
        let deadline = Instant::now() + self.running_time;
        let mut pushed = 0u64;
        while Instant::now() < deadline && !shutdown.is_set() {
            let request = AccessRequest {
                client_id: self.id,
                page_offset: self.generator.next_offset(),
                op: self.generator.next_op(self.read_ratio),
            };
            if !self.push_with_backoff(buffer, shutdown, request) {
                break;
            }
            pushed += 1;
        }
        let end = AccessRequest {
            client_id: self.id,
            page_offset: 0,
            op: Operation::End,
        };
        self.push_with_backoff(buffer, shutdown, end);
        debug!("client {} done after {} requests", self.id, pushed);
        pushed
    }

    fn push_with_backoff(
        &self,
        buffer: &RingBuffer<AccessRequest>,
        shutdown: &Shutdown,
        request: AccessRequest,
    ) -> bool {
        let mut request = request;
        loop {
            match buffer.push(request) {
                Ok(()) => return true,
                Err(back) => {
                    // a set shutdown flag means the server already stopped
                    // popping; spinning further would never complete
                    if shutdown.is_set() {
                        return false;
                    }
                    request = back;
                    std::thread::sleep(BACKOFF);
                }
            }
        }
    }
}
