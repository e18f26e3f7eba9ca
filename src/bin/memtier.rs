use clap::{crate_version, value_t, values_t, App, Arg, ArgMatches};
use log::{error, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use memtier::config::{self, ClientConfig, Config, Pattern, ServerConfig};
use memtier::message::AccessRequest;
use memtier::metrics::{Metrics, DEFAULT_QUANTILES};
use memtier::policy::Policy;
use memtier::result::Result;
use memtier::ring_buffer::RingBuffer;
use memtier::server::Server;
use memtier::workload::Client;
use simple_error::{bail, try_with};

fn build_app() -> App<'static, 'static> {
    App::new("memtier")
        .about("Tiered-memory page manager with a synthetic workload driver.")
        .version(crate_version!())
        .arg(
            Arg::with_name("buffer-size")
                .long("buffer-size")
                .help("Capacity of the request ring buffer")
                .takes_value(true)
                .default_value("10"),
        )
        .arg(
            Arg::with_name("num-tiers")
                .long("num-tiers")
                .help("Tier topology: 2 (DRAM+PMEM) or 3 (local/remote NUMA + PMEM)")
                .takes_value(true)
                .default_value("3"),
        )
        .arg(
            Arg::with_name("mem-sizes")
                .long("mem-sizes")
                .help("Per-tier capacity in pages, comma separated in tier order")
                .takes_value(true)
                .use_delimiter(true)
                .required(true),
        )
        .arg(
            Arg::with_name("patterns")
                .long("patterns")
                .help("Access pattern per client: uniform, hot or zipfian")
                .takes_value(true)
                .use_delimiter(true)
                .required(true),
        )
        .arg(
            Arg::with_name("client-tier-sizes")
                .long("client-tier-sizes")
                .help("Per-client requested pages, one space-separated tuple per client")
                .takes_value(true)
                .use_delimiter(true)
                .required(true),
        )
        .arg(
            Arg::with_name("zipfs")
                .long("zipfs")
                .help("Zipf skew factor")
                .takes_value(true)
                .default_value("0.99"),
        )
        .arg(
            Arg::with_name("running-time")
                .long("running-time")
                .help("Per-client workload duration in seconds")
                .takes_value(true)
                .default_value("10"),
        )
        .arg(
            Arg::with_name("ratio")
                .long("ratio")
                .help("Read probability in [0, 1]")
                .takes_value(true)
                .default_value("0.5"),
        )
        .arg(
            Arg::with_name("sample-rate")
                .long("sample-rate")
                .help("Periodic metrics interval in seconds")
                .takes_value(true)
                .default_value("1"),
        )
        .arg(
            Arg::with_name("policy-type")
                .long("policy-type")
                .help("Page classification policy: lru, frequency or hybrid")
                .takes_value(true)
                .default_value("lru"),
        )
        .arg(
            Arg::with_name("hot-threshold")
                .long("hot-threshold")
                .help("LRU/hybrid: pages idle at most this many ms are hot")
                .takes_value(true)
                .default_value("100"),
        )
        .arg(
            Arg::with_name("cold-threshold")
                .long("cold-threshold")
                .help("LRU/hybrid: pages idle at least this many ms are cold")
                .takes_value(true)
                .default_value("1000"),
        )
        .arg(
            Arg::with_name("hot-count")
                .long("hot-count")
                .help("Frequency/hybrid: access count at or above which a page is hot")
                .takes_value(true)
                .default_value("10"),
        )
        .arg(
            Arg::with_name("cold-count")
                .long("cold-count")
                .help("Frequency/hybrid: access count at or below which a page is cold")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::with_name("recency-weight")
                .long("recency-weight")
                .help("Hybrid: weight of the recency indicators")
                .takes_value(true)
                .default_value("1.0"),
        )
        .arg(
            Arg::with_name("frequency-weight")
                .long("frequency-weight")
                .help("Hybrid: weight of the frequency indicators")
                .takes_value(true)
                .default_value("1.0"),
        )
        .arg(
            Arg::with_name("scan-interval")
                .long("scan-interval")
                .help("Pause in seconds after each full table scan")
                .takes_value(true)
                .default_value("5"),
        )
        .arg(
            Arg::with_name("cache-ring")
                .long("cache-ring")
                .help("Track cache-tier residents in a CLOCK ring (true/false)")
                .takes_value(true)
                .default_value("false"),
        )
        .arg(
            Arg::with_name("output")
                .long("output")
                .help("Final latency CDF file")
                .takes_value(true)
                .default_value("result/latency.csv"),
        )
        .arg(
            Arg::with_name("periodic-output")
                .long("periodic-output")
                .help("Periodic metrics file")
                .takes_value(true)
                .default_value("result/periodic_metrics.csv"),
        )
}

fn parse_policy(matches: &ArgMatches) -> Result<Policy> {
    let hot_ms = try_with!(
        value_t!(matches, "hot-threshold", u64),
        "invalid hot threshold"
    );
    let cold_ms = try_with!(
        value_t!(matches, "cold-threshold", u64),
        "invalid cold threshold"
    );
    let hot_count = try_with!(value_t!(matches, "hot-count", u64), "invalid hot count");
    let cold_count = try_with!(value_t!(matches, "cold-count", u64), "invalid cold count");
    let recency_weight = try_with!(
        value_t!(matches, "recency-weight", f64),
        "invalid recency weight"
    );
    let frequency_weight = try_with!(
        value_t!(matches, "frequency-weight", f64),
        "invalid frequency weight"
    );
    match matches.value_of("policy-type").unwrap_or("lru") {
        "lru" => Ok(Policy::Lru { hot_ms, cold_ms }),
        "frequency" => Ok(Policy::Frequency {
            hot_count,
            cold_count,
        }),
        "hybrid" => Ok(Policy::Hybrid {
            hot_ms,
            cold_ms,
            hot_count,
            cold_count,
            recency_weight,
            frequency_weight,
        }),
        other => bail!("unknown policy type: {}", other),
    }
}

fn parse_config(matches: &ArgMatches) -> Result<Config> {
    let num_tiers = try_with!(value_t!(matches, "num-tiers", usize), "invalid tier count");
    if num_tiers < 2 || num_tiers > 3 {
        bail!("number of tiers must be 2 or 3");
    }

    let mem_sizes = try_with!(
        values_t!(matches, "mem-sizes", String),
        "invalid memory sizes"
    );
    let capacities = config::parse_mem_sizes(&mem_sizes, num_tiers)?;

    let patterns = try_with!(values_t!(matches, "patterns", String), "invalid patterns");
    let tier_tuples = try_with!(
        values_t!(matches, "client-tier-sizes", String),
        "invalid client tier sizes"
    );
    if patterns.len() != tier_tuples.len() {
        bail!(
            "number of patterns ({}) must match number of clients ({})",
            patterns.len(),
            tier_tuples.len()
        );
    }
    let mut clients = Vec::with_capacity(patterns.len());
    for (pattern, tuple) in patterns.iter().zip(tier_tuples.iter()) {
        clients.push(ClientConfig {
            pattern: Pattern::parse(pattern)?,
            tier_sizes: config::parse_tier_tuple(tuple, num_tiers)?,
        });
    }

    let cache_ring = match matches.value_of("cache-ring").unwrap_or("false") {
        "true" | "1" => true,
        "false" | "0" => false,
        other => bail!("invalid cache-ring value: {}", other),
    };

    let config = Config {
        buffer_size: try_with!(value_t!(matches, "buffer-size", usize), "invalid buffer size"),
        server: ServerConfig {
            num_tiers,
            capacities,
        },
        clients,
        zipf_skew: try_with!(value_t!(matches, "zipfs", f64), "invalid zipf skew"),
        running_time_secs: try_with!(
            value_t!(matches, "running-time", f64),
            "invalid running time"
        ),
        read_ratio: try_with!(value_t!(matches, "ratio", f64), "invalid read ratio"),
        sample_rate_secs: try_with!(value_t!(matches, "sample-rate", f64), "invalid sample rate"),
        policy: parse_policy(matches)?,
        scan_interval_secs: try_with!(
            value_t!(matches, "scan-interval", f64),
            "invalid scan interval"
        ),
        cache_ring,
        output: PathBuf::from(matches.value_of("output").unwrap_or("result/latency.csv")),
        periodic_output: PathBuf::from(
            matches
                .value_of("periodic-output")
                .unwrap_or("result/periodic_metrics.csv"),
        ),
    };
    config.validate()?;
    Ok(config)
}

/// LOG_LEVEL uses the syslog-ish names trace/debug/info/warning/error/fatal.
fn init_logging() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| String::from("info"));
    let filter = match level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warning" | "warn" => LevelFilter::Warn,
        "error" | "fatal" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(filter).init();
}

fn run(config: &Config) -> Result<()> {
    let metrics = Arc::new(Metrics::new(&DEFAULT_QUANTILES));
    let buffer: Arc<RingBuffer<AccessRequest>> = Arc::new(RingBuffer::new(config.buffer_size));
    let server = Server::new(config, Arc::clone(&metrics), Arc::clone(&buffer))?;
    let shutdown = server.shutdown_handle();

    let mut producers = Vec::with_capacity(config.clients.len());
    for (id, client_config) in config.clients.iter().enumerate() {
        let mut client = Client::new(
            id,
            client_config.pattern,
            client_config.total_pages(),
            config.zipf_skew,
            config.read_ratio,
            Duration::from_secs_f64(config.running_time_secs),
        );
        let buffer = Arc::clone(&buffer);
        let shutdown = Arc::clone(&shutdown);
        let handle = try_with!(
            std::thread::Builder::new()
                .name(format!("client-{}", id))
                .spawn(move || client.run(&buffer, &shutdown)),
            "cannot spawn client {}",
            id
        );
        producers.push(handle);
    }

    server.run()?;

    for producer in producers {
        match producer.join() {
            Ok(pushed) => log::debug!("producer pushed {} requests", pushed),
            Err(e) => error!("client thread panicked: {:?}", e),
        }
    }

    metrics.log_summary(config.server.num_tiers, server.occupancies());
    try_with!(
        metrics.write_latency_cdf(&config.output),
        "cannot write latency CDF"
    );
    Ok(())
}

fn main() {
    init_logging();
    let matches = build_app().get_matches();
    let config = match parse_config(&matches) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            std::process::exit(1);
        }
    };
    config.log_summary();
    if let Err(err) = run(&config) {
        error!("{}", err);
        std::process::exit(1);
    }
}
