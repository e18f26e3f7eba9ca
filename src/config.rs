use log::info;
use simple_error::bail;
use std::path::PathBuf;

use crate::policy::Policy;
use crate::result::Result;
use crate::tier::{Tier, TIER_COUNT};

/// Synthetic access pattern of one workload client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Uniform random over the client's pages.
    Uniform,
    /// 70% of accesses to the first 10% of pages, 20% to the next 20%,
    /// 10% to the rest.
    Hot,
    /// Zipf-distributed ranks with configurable skew.
    Zipfian,
}

impl Pattern {
    pub fn parse(s: &str) -> Result<Pattern> {
        match s {
            "uniform" => Ok(Pattern::Uniform),
            "hot" => Ok(Pattern::Hot),
            "zipfian" => Ok(Pattern::Zipfian),
            other => bail!("invalid pattern type: {}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub pattern: Pattern,
    /// Requested pages per tier, in tier order; length equals `num_tiers`.
    pub tier_sizes: Vec<usize>,
}

impl ClientConfig {
    pub fn total_pages(&self) -> usize {
        self.tier_sizes.iter().sum()
    }

    /// Pages this client requested in `tier`, mapped onto the 2- or 3-tier
    /// layout: with two tiers the second entry is PMEM and REMOTE is zero.
    pub fn pages_in(&self, tier: Tier, num_tiers: usize) -> usize {
        let idx = match (tier, num_tiers) {
            (Tier::Local, _) => 0,
            (Tier::Remote, 3) => 1,
            (Tier::Remote, _) => return 0,
            (Tier::Pmem, 3) => 2,
            (Tier::Pmem, _) => 1,
        };
        self.tier_sizes.get(idx).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_tiers: usize,
    /// Capacities indexed by `Tier`; REMOTE is zero with two tiers.
    pub capacities: [usize; TIER_COUNT],
}

impl ServerConfig {
    pub fn capacity(&self, tier: Tier) -> usize {
        self.capacities[tier.index()]
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub buffer_size: usize,
    pub server: ServerConfig,
    pub clients: Vec<ClientConfig>,
    pub zipf_skew: f64,
    pub running_time_secs: f64,
    pub read_ratio: f64,
    pub sample_rate_secs: f64,
    pub policy: Policy,
    pub scan_interval_secs: f64,
    pub cache_ring: bool,
    pub output: PathBuf,
    pub periodic_output: PathBuf,
}

/// Parse a comma-separated list of page counts, e.g. "100,100,100".
pub fn parse_mem_sizes(values: &[String], num_tiers: usize) -> Result<[usize; TIER_COUNT]> {
    if values.len() != num_tiers {
        bail!(
            "server configuration must have exactly {} memory sizes, got {}",
            num_tiers,
            values.len()
        );
    }
    let mut capacities = [0usize; TIER_COUNT];
    for (i, v) in values.iter().enumerate() {
        let pages = match v.trim().parse::<usize>() {
            Ok(p) => p,
            Err(_) => bail!("invalid memory size: {}", v),
        };
        // with two tiers the second value is the PMEM capacity
        let idx = if num_tiers == 2 && i == 1 { 2 } else { i };
        capacities[idx] = pages;
    }
    Ok(capacities)
}

/// Parse one client's space-separated tier tuple, e.g. "50 50 50".
pub fn parse_tier_tuple(value: &str, num_tiers: usize) -> Result<Vec<usize>> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != num_tiers {
        bail!(
            "client tier tuple {:?} must have {} values",
            value,
            num_tiers
        );
    }
    let mut sizes = Vec::with_capacity(parts.len());
    for p in parts {
        match p.parse::<usize>() {
            Ok(v) => sizes.push(v),
            Err(_) => bail!("invalid tier size: {}", p),
        }
    }
    Ok(sizes)
}

impl Config {
    /// Cross-field validation; called once after parsing, before any
    /// memory is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.server.num_tiers < 2 || self.server.num_tiers > 3 {
            bail!("number of tiers must be 2 or 3");
        }
        if self.clients.is_empty() {
            bail!("at least one client is required");
        }
        if !(0.0..=1.0).contains(&self.read_ratio) {
            bail!("read ratio must be within [0, 1]");
        }
        if self.zipf_skew <= 0.0 {
            bail!("zipf skew factor must be positive");
        }
        if self.buffer_size == 0 {
            bail!("ring buffer capacity must be positive");
        }
        if self.running_time_secs <= 0.0 || !self.running_time_secs.is_finite() {
            bail!("running time must be positive");
        }
        if self.sample_rate_secs <= 0.0 || !self.sample_rate_secs.is_finite() {
            bail!("sample rate must be positive");
        }
        if self.scan_interval_secs < 0.0 || !self.scan_interval_secs.is_finite() {
            bail!("scan interval must not be negative");
        }
        if let Policy::Hybrid {
            recency_weight,
            frequency_weight,
            ..
        } = self.policy
        {
            if recency_weight <= 0.0 || frequency_weight <= 0.0 {
                bail!("policy weights must be positive");
            }
        }

        for (i, client) in self.clients.iter().enumerate() {
            if client.tier_sizes.len() != self.server.num_tiers {
                bail!(
                    "each client needs {} tier sizes, got {}",
                    self.server.num_tiers,
                    client.tier_sizes.len()
                );
            }
            if client.total_pages() == 0 {
                bail!("client {} requests no pages", i);
            }
        }

        for tier in Tier::all() {
            let requested: usize = self
                .clients
                .iter()
                .map(|c| c.pages_in(tier, self.server.num_tiers))
                .sum();
            if requested > self.server.capacity(tier) {
                bail!("memory allocation exceeds {} limit", tier);
            }
        }
        Ok(())
    }

    pub fn total_pages(&self) -> usize {
        self.clients.iter().map(|c| c.total_pages()).sum()
    }

    /// Log the effective configuration once at startup.
    pub fn log_summary(&self) {
        info!("========== configuration ==========");
        info!("buffer size: {}", self.buffer_size);
        info!("tiers: {}", self.server.num_tiers);
        for tier in Tier::all() {
            if self.server.num_tiers == 2 && tier == Tier::Remote {
                continue;
            }
            info!("  {} capacity: {} pages", tier, self.server.capacity(tier));
        }
        info!("policy: {:?}", self.policy);
        info!("scan interval: {}s", self.scan_interval_secs);
        info!("sample rate: {}s", self.sample_rate_secs);
        info!("running time: {}s", self.running_time_secs);
        info!("read ratio: {}", self.read_ratio);
        info!("cache ring: {}", self.cache_ring);
        for (i, client) in self.clients.iter().enumerate() {
            info!(
                "client {}: pattern {:?}, tier sizes {:?}",
                i, client.pattern, client.tier_sizes
            );
        }
        info!("===================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            buffer_size: 10,
            server: ServerConfig {
                num_tiers: 3,
                capacities: [10, 10, 10],
            },
            clients: vec![ClientConfig {
                pattern: Pattern::Uniform,
                tier_sizes: vec![5, 5, 5],
            }],
            zipf_skew: 0.99,
            running_time_secs: 1.0,
            read_ratio: 1.0,
            sample_rate_secs: 1.0,
            policy: Policy::Lru {
                hot_ms: 100,
                cold_ms: 1000,
            },
            scan_interval_secs: 1.0,
            cache_ring: false,
            output: PathBuf::from("result/latency.csv"),
            periodic_output: PathBuf::from("result/periodic_metrics.csv"),
        }
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().expect("config should be valid");
    }

    #[test]
    fn oversubscribed_local_is_rejected() {
        let mut config = base_config();
        config.clients[0].tier_sizes = vec![20, 0, 0];
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("exceeds LOCAL limit"));
    }

    #[test]
    fn oversubscription_across_clients_is_rejected() {
        let mut config = base_config();
        config.clients.push(ClientConfig {
            pattern: Pattern::Hot,
            tier_sizes: vec![6, 0, 0],
        });
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("exceeds LOCAL limit"));
    }

    #[test]
    fn bad_ratio_is_rejected() {
        let mut config = base_config();
        config.read_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_client_is_rejected() {
        let mut config = base_config();
        config.clients[0].tier_sizes = vec![0, 0, 0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn two_tier_mapping() {
        let mut config = base_config();
        config.server = ServerConfig {
            num_tiers: 2,
            capacities: parse_mem_sizes(
                &["50".to_string(), "50".to_string()],
                2,
            )
            .expect("parse failed"),
        };
        config.clients = vec![ClientConfig {
            pattern: Pattern::Uniform,
            tier_sizes: vec![50, 50],
        }];
        assert_eq!(config.server.capacity(Tier::Local), 50);
        assert_eq!(config.server.capacity(Tier::Remote), 0);
        assert_eq!(config.server.capacity(Tier::Pmem), 50);
        let client = &config.clients[0];
        assert_eq!(client.pages_in(Tier::Local, 2), 50);
        assert_eq!(client.pages_in(Tier::Remote, 2), 0);
        assert_eq!(client.pages_in(Tier::Pmem, 2), 50);
        config.validate().expect("config should be valid");
    }

    #[test]
    fn tier_tuple_parsing() {
        assert_eq!(
            parse_tier_tuple("50 50 50", 3).expect("parse failed"),
            vec![50, 50, 50]
        );
        assert!(parse_tier_tuple("50 50", 3).is_err());
        assert!(parse_tier_tuple("a b c", 3).is_err());
    }

    #[test]
    fn pattern_parsing() {
        assert_eq!(Pattern::parse("uniform").expect("parse failed"), Pattern::Uniform);
        assert_eq!(Pattern::parse("hot").expect("parse failed"), Pattern::Hot);
        assert_eq!(Pattern::parse("zipfian").expect("parse failed"), Pattern::Zipfian);
        assert!(Pattern::parse("skewed").is_err());
    }
}
