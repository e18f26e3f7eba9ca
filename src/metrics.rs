use log::info;
use simple_error::try_with;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::result::Result;
use crate::tier::Tier;

/// Deciles P10..P90, the default shape of the latency CDF.
pub const DEFAULT_QUANTILES: [f64; 9] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9];

/// One P² marker set tracking a single quantile without storing samples
/// (Jain & Chlamtac). Five markers: min, two intermediates, the quantile
/// itself, max.
struct P2Quantile {
    q: f64,
    heights: [f64; 5],
    positions: [i64; 5],
    desired: [f64; 5],
    increments: [f64; 5],
    initial: Vec<f64>,
}

impl P2Quantile {
    fn new(q: f64) -> P2Quantile {
        P2Quantile {
            q,
            heights: [0.0; 5],
            positions: [1, 2, 3, 4, 5],
            desired: [
                1.0,
                1.0 + 2.0 * q,
                1.0 + 4.0 * q,
                3.0 + 2.0 * q,
                5.0,
            ],
            increments: [0.0, q / 2.0, q, (1.0 + q) / 2.0, 1.0],
            initial: Vec::with_capacity(5),
        }
    }

    fn observe(&mut self, x: f64) {
        if self.initial.len() < 5 {
            self.initial.push(x);
            if self.initial.len() == 5 {
                self.initial
                    .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                for (h, v) in self.heights.iter_mut().zip(self.initial.iter()) {
                    *h = *v;
                }
            }
            return;
        }

        let k = if x < self.heights[0] {
            self.heights[0] = x;
            0
        } else if x >= self.heights[4] {
            self.heights[4] = x;
            3
        } else {
            let mut cell = 0;
            for i in 0..4 {
                if self.heights[i] <= x && x < self.heights[i + 1] {
                    cell = i;
                    break;
                }
            }
            cell
        };

        for pos in self.positions.iter_mut().skip(k + 1) {
            *pos += 1;
        }
        for (d, inc) in self.desired.iter_mut().zip(self.increments.iter()) {
            *d += inc;
        }

        for i in 1..4 {
            let d = self.desired[i] - self.positions[i] as f64;
            let room_right = self.positions[i + 1] - self.positions[i] > 1;
            let room_left = self.positions[i - 1] - self.positions[i] < -1;
            if (d >= 1.0 && room_right) || (d <= -1.0 && room_left) {
                let s: i64 = if d >= 1.0 { 1 } else { -1 };
                let h = self.parabolic(i, s);
                self.heights[i] = if self.heights[i - 1] < h && h < self.heights[i + 1] {
                    h
                } else {
                    self.linear(i, s)
                };
                self.positions[i] += s;
            }
        }
    }

    fn parabolic(&self, i: usize, s: i64) -> f64 {
        let n = &self.positions;
        let h = &self.heights;
        let s = s as f64;
        let d_prev = (n[i] - n[i - 1]) as f64;
        let d_next = (n[i + 1] - n[i]) as f64;
        h[i]
            + s / ((n[i + 1] - n[i - 1]) as f64)
                * ((d_prev + s) * (h[i + 1] - h[i]) / d_next
                    + (d_next - s) * (h[i] - h[i - 1]) / d_prev)
    }

    fn linear(&self, i: usize, s: i64) -> f64 {
        let j = (i as i64 + s) as usize;
        self.heights[i]
            + s as f64 * (self.heights[j] - self.heights[i])
                / ((self.positions[j] - self.positions[i]) as f64)
    }

    fn value(&self) -> f64 {
        if self.initial.len() < 5 {
            if self.initial.is_empty() {
                return 0.0;
            }
            let mut sorted = self.initial.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = (self.q * (sorted.len() - 1) as f64).round() as usize;
            return sorted[idx.min(sorted.len() - 1)];
        }
        self.heights[2]
    }
}

/// Streaming latency statistics: exact min/max/mean plus P² estimates for
/// the configured quantiles. Constant memory regardless of sample count.
pub struct LatencyEstimator {
    cells: Vec<P2Quantile>,
    min: u64,
    max: u64,
    sum: u128,
    count: u64,
}

impl LatencyEstimator {
    pub fn new(quantiles: &[f64]) -> LatencyEstimator {
        LatencyEstimator {
            cells: quantiles.iter().map(|&q| P2Quantile::new(q)).collect(),
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
        }
    }

    pub fn record(&mut self, sample_ns: u64) {
        self.min = self.min.min(sample_ns);
        self.max = self.max.max(sample_ns);
        self.sum += u128::from(sample_ns);
        self.count += 1;
        for cell in &mut self.cells {
            cell.observe(sample_ns as f64);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    pub fn quantiles(&self) -> Vec<(f64, f64)> {
        self.cells.iter().map(|c| (c.q, c.value())).collect()
    }
}

/// Counter values at one instant, used for periodic deltas.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub local_access: u64,
    pub remote_access: u64,
    pub pmem_access: u64,
    pub local_to_remote: u64,
    pub remote_to_local: u64,
    pub local_to_pmem: u64,
    pub pmem_to_local: u64,
    pub remote_to_pmem: u64,
    pub pmem_to_remote: u64,
    pub total_latency_ns: u64,
}

impl CounterSnapshot {
    pub fn total_access(&self) -> u64 {
        self.local_access + self.remote_access + self.pmem_access
    }

    pub fn total_migrations(&self) -> u64 {
        self.local_to_remote
            + self.remote_to_local
            + self.local_to_pmem
            + self.pmem_to_local
            + self.remote_to_pmem
            + self.pmem_to_remote
    }
}

/// Process-wide metrics sink, passed around as an explicit handle. Counters
/// are relaxed atomics touched on the access path; the latency estimator
/// sits behind a mutex taken once per access.
pub struct Metrics {
    local_access: AtomicU64,
    remote_access: AtomicU64,
    pmem_access: AtomicU64,
    local_to_remote: AtomicU64,
    remote_to_local: AtomicU64,
    local_to_pmem: AtomicU64,
    pmem_to_local: AtomicU64,
    remote_to_pmem: AtomicU64,
    pmem_to_remote: AtomicU64,
    total_latency_ns: AtomicU64,
    latency: Mutex<LatencyEstimator>,
}

impl Metrics {
    pub fn new(quantiles: &[f64]) -> Metrics {
        Metrics {
            local_access: AtomicU64::new(0),
            remote_access: AtomicU64::new(0),
            pmem_access: AtomicU64::new(0),
            local_to_remote: AtomicU64::new(0),
            remote_to_local: AtomicU64::new(0),
            local_to_pmem: AtomicU64::new(0),
            pmem_to_local: AtomicU64::new(0),
            remote_to_pmem: AtomicU64::new(0),
            pmem_to_remote: AtomicU64::new(0),
            total_latency_ns: AtomicU64::new(0),
            latency: Mutex::new(LatencyEstimator::new(quantiles)),
        }
    }

    fn estimator(&self) -> MutexGuard<LatencyEstimator> {
        match self.latency.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_access(&self, tier: Tier, latency_ns: u64) {
        let counter = match tier {
            Tier::Local => &self.local_access,
            Tier::Remote => &self.remote_access,
            Tier::Pmem => &self.pmem_access,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.estimator().record(latency_ns);
    }

    pub fn record_migration(&self, from: Tier, to: Tier) {
        let counter = match (from, to) {
            (Tier::Local, Tier::Remote) => &self.local_to_remote,
            (Tier::Remote, Tier::Local) => &self.remote_to_local,
            (Tier::Local, Tier::Pmem) => &self.local_to_pmem,
            (Tier::Pmem, Tier::Local) => &self.pmem_to_local,
            (Tier::Remote, Tier::Pmem) => &self.remote_to_pmem,
            (Tier::Pmem, Tier::Remote) => &self.pmem_to_remote,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            local_access: self.local_access.load(Ordering::Relaxed),
            remote_access: self.remote_access.load(Ordering::Relaxed),
            pmem_access: self.pmem_access.load(Ordering::Relaxed),
            local_to_remote: self.local_to_remote.load(Ordering::Relaxed),
            remote_to_local: self.remote_to_local.load(Ordering::Relaxed),
            local_to_pmem: self.local_to_pmem.load(Ordering::Relaxed),
            pmem_to_local: self.pmem_to_local.load(Ordering::Relaxed),
            remote_to_pmem: self.remote_to_pmem.load(Ordering::Relaxed),
            pmem_to_remote: self.pmem_to_remote.load(Ordering::Relaxed),
            total_latency_ns: self.total_latency_ns.load(Ordering::Relaxed),
        }
    }

    /// Write the final latency CDF: Min, the configured quantiles, Max and
    /// Mean, one row each.
    pub fn write_latency_cdf(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                try_with!(
                    std::fs::create_dir_all(parent),
                    "cannot create output directory {:?}",
                    parent
                );
            }
        }
        let mut file = try_with!(File::create(path), "cannot create {:?}", path);
        let estimator = self.estimator();
        try_with!(
            writeln!(file, "percentile,latency_ns"),
            "cannot write {:?}",
            path
        );
        try_with!(
            writeln!(file, "Min,{}", estimator.min()),
            "cannot write {:?}",
            path
        );
        for (q, value) in estimator.quantiles() {
            try_with!(
                writeln!(file, "P{:.0},{:.2}", q * 100.0, value),
                "cannot write {:?}",
                path
            );
        }
        try_with!(
            writeln!(file, "Max,{}", estimator.max()),
            "cannot write {:?}",
            path
        );
        try_with!(
            writeln!(file, "Mean,{:.2}", estimator.mean()),
            "cannot write {:?}",
            path
        );
        Ok(())
    }

    /// Final INFO summary block.
    pub fn log_summary(&self, num_tiers: usize, occupancies: [usize; 3]) {
        let snap = self.snapshot();
        let estimator = self.estimator();
        if num_tiers == 3 {
            info!("======== memory access metrics ========");
            info!("access counts:");
            info!("  local:  {}", snap.local_access);
            info!("  remote: {}", snap.remote_access);
            info!("  pmem:   {}", snap.pmem_access);
        } else {
            info!("==== memory access metrics (two tiers) ====");
            info!("access counts:");
            info!("  dram: {}", snap.local_access);
            info!("  pmem: {}", snap.pmem_access);
        }
        info!("access latency (ns):");
        info!("  min:  {}", estimator.min());
        for (q, value) in estimator.quantiles() {
            info!("  p{:.0}:  {:.0}", q * 100.0, value);
        }
        info!("  max:  {}", estimator.max());
        info!("  mean: {:.2}", estimator.mean());
        info!("migration counts:");
        if num_tiers == 3 {
            info!("  local -> remote: {}", snap.local_to_remote);
            info!("  remote -> local: {}", snap.remote_to_local);
            info!("  remote -> pmem:  {}", snap.remote_to_pmem);
            info!("  pmem -> remote:  {}", snap.pmem_to_remote);
        }
        info!("  local -> pmem:   {}", snap.local_to_pmem);
        info!("  pmem -> local:   {}", snap.pmem_to_local);
        info!(
            "tier occupancy: local {} remote {} pmem {}",
            occupancies[0], occupancies[1], occupancies[2]
        );
        if snap.total_latency_ns > 0 {
            let throughput =
                snap.total_access() as f64 * 1e9 / snap.total_latency_ns as f64;
            info!("throughput: {:.2} ops/sec", throughput);
        }
        info!("=======================================");
    }
}

/// Writes one CSV row per sampling tick with counter deltas and
/// instantaneous tier occupancies. The file and header are created lazily
/// on the first tick.
pub struct PeriodicWriter {
    path: PathBuf,
    num_tiers: usize,
    file: Option<File>,
    prev: CounterSnapshot,
}

impl PeriodicWriter {
    pub fn new(path: &Path, num_tiers: usize) -> PeriodicWriter {
        PeriodicWriter {
            path: path.to_path_buf(),
            num_tiers,
            file: None,
            prev: CounterSnapshot::default(),
        }
    }

    fn open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    try_with!(
                        std::fs::create_dir_all(parent),
                        "cannot create output directory {:?}",
                        parent
                    );
                }
            }
            let mut file = try_with!(File::create(&self.path), "cannot create {:?}", self.path);
            let header = if self.num_tiers == 3 {
                "Latency(ns),Throughput(ops/s),LocalAccess,RemoteAccess,PmemAccess,\
                 TotalAccess,LocalCount,RemoteCount,PmemCount"
            } else {
                "Latency(ns),Throughput(ops/s),LocalAccess,PmemAccess,TotalAccess,\
                 LocalCount,PmemCount"
            };
            try_with!(writeln!(file, "{}", header), "cannot write {:?}", self.path);
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("file was just opened"))
    }

    pub fn tick(
        &mut self,
        metrics: &Metrics,
        occupancies: [usize; 3],
        elapsed_secs: f64,
    ) -> Result<()> {
        let snap = metrics.snapshot();
        let d_local = snap.local_access - self.prev.local_access;
        let d_remote = snap.remote_access - self.prev.remote_access;
        let d_pmem = snap.pmem_access - self.prev.pmem_access;
        let d_total = d_local + d_remote + d_pmem;
        let d_latency = snap.total_latency_ns - self.prev.total_latency_ns;
        let avg_latency = if d_total > 0 {
            d_latency as f64 / d_total as f64
        } else {
            0.0
        };
        let throughput = if elapsed_secs > 0.0 {
            d_total as f64 / elapsed_secs
        } else {
            0.0
        };

        let num_tiers = self.num_tiers;
        let path = self.path.clone();
        let file = self.open()?;
        let row = if num_tiers == 3 {
            format!(
                "{:.2},{:.2},{},{},{},{},{},{},{}",
                avg_latency,
                throughput,
                d_local,
                d_remote,
                d_pmem,
                d_total,
                occupancies[0],
                occupancies[1],
                occupancies[2]
            )
        } else {
            format!(
                "{:.2},{:.2},{},{},{},{},{}",
                avg_latency, throughput, d_local, d_pmem, d_total, occupancies[0], occupancies[2]
            )
        };
        try_with!(writeln!(file, "{}", row), "cannot write {:?}", path);
        self.prev = snap;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn estimator_exact_stats() {
        let mut est = LatencyEstimator::new(&DEFAULT_QUANTILES);
        for v in [5u64, 1, 9, 3, 7] {
            est.record(v);
        }
        assert_eq!(est.min(), 1);
        assert_eq!(est.max(), 9);
        assert_eq!(est.count(), 5);
        assert!((est.mean() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn estimator_empty() {
        let est = LatencyEstimator::new(&DEFAULT_QUANTILES);
        assert_eq!(est.min(), 0);
        assert_eq!(est.max(), 0);
        assert_eq!(est.mean(), 0.0);
        for (_, v) in est.quantiles() {
            assert_eq!(v, 0.0);
        }
    }

    #[test]
    fn p2_tracks_uniform_median() {
        let mut est = LatencyEstimator::new(&[0.5]);
        // deterministic uniform sweep over 1..=1001, shuffled by stride
        let mut v = 0u64;
        for _ in 0..1001 {
            v = (v + 467) % 1001;
            est.record(v + 1);
        }
        let (_, p50) = est.quantiles()[0];
        // P² is an estimate; uniform data should land near the middle
        assert!((p50 - 501.0).abs() < 50.0, "p50 estimate too far: {}", p50);
    }

    #[test]
    fn p2_monotone_deciles() {
        let mut est = LatencyEstimator::new(&DEFAULT_QUANTILES);
        let mut v = 0u64;
        for _ in 0..5000 {
            v = (v + 7919) % 10000;
            est.record(v);
        }
        // cells are independent estimates, so allow a little estimation
        // noise between neighbors; true deciles are 1000 apart
        let quantiles = est.quantiles();
        for pair in quantiles.windows(2) {
            assert!(
                pair[0].1 <= pair[1].1 + 100.0,
                "deciles not monotone: {:?}",
                quantiles
            );
        }
    }

    #[test]
    fn counters_and_snapshot() {
        let metrics = Metrics::new(&DEFAULT_QUANTILES);
        metrics.record_access(Tier::Local, 100);
        metrics.record_access(Tier::Pmem, 300);
        metrics.record_migration(Tier::Pmem, Tier::Local);
        metrics.record_migration(Tier::Local, Tier::Local); // ignored
        let snap = metrics.snapshot();
        assert_eq!(snap.local_access, 1);
        assert_eq!(snap.pmem_access, 1);
        assert_eq!(snap.total_access(), 2);
        assert_eq!(snap.pmem_to_local, 1);
        assert_eq!(snap.total_migrations(), 1);
        assert_eq!(snap.total_latency_ns, 400);
    }

    #[test]
    fn cdf_file_format() {
        let metrics = Metrics::new(&DEFAULT_QUANTILES);
        for v in 1..=100 {
            metrics.record_access(Tier::Local, v);
        }
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = dir.path().join("latency.csv");
        metrics.write_latency_cdf(&path).expect("write failed");

        let mut content = String::new();
        File::open(&path)
            .expect("open failed")
            .read_to_string(&mut content)
            .expect("read failed");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "percentile,latency_ns");
        assert_eq!(lines[1], "Min,1");
        assert!(lines[2].starts_with("P10,"));
        assert!(lines[10].starts_with("P90,"));
        assert_eq!(lines[11], "Max,100");
        assert!(lines[12].starts_with("Mean,"));
        assert_eq!(lines.len(), 13);
    }

    #[test]
    fn periodic_rows_are_deltas() {
        let metrics = Metrics::new(&DEFAULT_QUANTILES);
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = dir.path().join("periodic.csv");
        let mut writer = PeriodicWriter::new(&path, 3);

        metrics.record_access(Tier::Local, 10);
        metrics.record_access(Tier::Local, 10);
        writer.tick(&metrics, [2, 0, 0], 1.0).expect("tick failed");
        metrics.record_access(Tier::Pmem, 30);
        writer.tick(&metrics, [1, 0, 1], 1.0).expect("tick failed");

        let mut content = String::new();
        File::open(&path)
            .expect("open failed")
            .read_to_string(&mut content)
            .expect("read failed");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines[0],
            "Latency(ns),Throughput(ops/s),LocalAccess,RemoteAccess,PmemAccess,\
             TotalAccess,LocalCount,RemoteCount,PmemCount"
        );
        // first row: 2 local accesses, avg 10ns
        assert_eq!(lines[1], "10.00,2.00,2,0,0,2,2,0,0");
        // second row: only the delta since the first tick
        assert_eq!(lines[2], "30.00,1.00,0,0,1,1,1,0,1");
    }

    #[test]
    fn two_tier_header_drops_remote() {
        let metrics = Metrics::new(&DEFAULT_QUANTILES);
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = dir.path().join("periodic.csv");
        let mut writer = PeriodicWriter::new(&path, 2);
        writer.tick(&metrics, [0, 0, 0], 1.0).expect("tick failed");

        let mut content = String::new();
        File::open(&path)
            .expect("open failed")
            .read_to_string(&mut content)
            .expect("read failed");
        assert!(content.starts_with(
            "Latency(ns),Throughput(ops/s),LocalAccess,PmemAccess,TotalAccess,\
             LocalCount,PmemCount"
        ));
    }
}
