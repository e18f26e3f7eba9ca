use log::{debug, error, info, warn};
use simple_error::try_with;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::interruptable_thread::InterruptableThread;
use crate::message::{AccessRequest, Operation};
use crate::metrics::{Metrics, PeriodicWriter};
use crate::page_table::PageTable;
use crate::result::Result;
use crate::ring_buffer::{RingBuffer, BACKOFF};
use crate::scanner::Scanner;
use crate::shutdown::Shutdown;
use crate::tier::TIER_COUNT;

/// Base offset and length of one client's slice of the page-id space.
#[derive(Debug, Clone, Copy)]
struct ClientSpan {
    base: usize,
    pages: usize,
}

struct ManagerCtx {
    buffer: Arc<RingBuffer<AccessRequest>>,
    table: Arc<PageTable>,
}

/// Orchestrates the three long-lived tasks: the manager consuming access
/// requests, the scanner driving migrations, and the periodic metrics
/// writer. Owns the page table and the per-client base offsets.
pub struct Server {
    table: Arc<PageTable>,
    buffer: Arc<RingBuffer<AccessRequest>>,
    metrics: Arc<Metrics>,
    shutdown: Arc<Shutdown>,
    scanner: Scanner,
    spans: Vec<ClientSpan>,
    sample_rate: Duration,
    periodic_output: PathBuf,
}

impl Server {
    pub fn new(
        config: &Config,
        metrics: Arc<Metrics>,
        buffer: Arc<RingBuffer<AccessRequest>>,
    ) -> Result<Server> {
        let table = try_with!(
            PageTable::init(
                &config.clients,
                &config.server,
                config.cache_ring,
                Arc::clone(&metrics),
            ),
            "cannot initialize page table"
        );

        let mut spans = Vec::with_capacity(config.clients.len());
        let mut base = 0;
        for client in &config.clients {
            let pages = client.total_pages();
            spans.push(ClientSpan { base, pages });
            base += pages;
        }

        let scanner = Scanner::new(
            config.policy.clone(),
            Duration::from_secs_f64(config.scan_interval_secs),
            config.server.num_tiers,
        );

        Ok(Server {
            table: Arc::new(table),
            buffer,
            metrics,
            shutdown: Arc::new(Shutdown::new()),
            scanner,
            spans,
            sample_rate: Duration::from_secs_f64(config.sample_rate_secs),
            periodic_output: config.periodic_output.clone(),
        })
    }

    /// Shared flag the workload producers poll so they stop spinning when
    /// the server goes down.
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    pub fn occupancies(&self) -> [usize; TIER_COUNT] {
        self.table.occupancies()
    }

    pub fn total_pages(&self) -> usize {
        self.table.size()
    }

    /// Run all three tasks to completion. Returns once every client sent
    /// END (or a worker failed) and all threads are joined.
    pub fn run(&self) -> Result<()> {
        let (err_tx, err_rx) = sync_channel(3);

        let spans = self.spans.clone();
        let manager = try_with!(
            InterruptableThread::spawn(
                "manager",
                Arc::clone(&self.shutdown),
                err_tx.clone(),
                move |ctx: &ManagerCtx, shutdown| {
                    let mut done = vec![false; spans.len()];
                    while !shutdown.is_set() {
                        match ctx.buffer.pop() {
                            Some(msg) => handle_request(ctx, &spans, &mut done, shutdown, msg),
                            None => std::thread::sleep(BACKOFF),
                        }
                    }
                    debug!("manager exiting");
                    Ok(())
                },
                ManagerCtx {
                    buffer: Arc::clone(&self.buffer),
                    table: Arc::clone(&self.table),
                },
            ),
            "cannot spawn manager thread"
        );

        let scan = self.scanner.clone();
        let scanner = try_with!(
            InterruptableThread::spawn(
                "scanner",
                Arc::clone(&self.shutdown),
                err_tx.clone(),
                move |table: &Arc<PageTable>, shutdown| {
                    scan.run(table, shutdown);
                    debug!("scanner thread exiting");
                    Ok(())
                },
                Arc::clone(&self.table),
            ),
            "cannot spawn scanner thread"
        );

        let sample_rate = self.sample_rate;
        let periodic_output = self.periodic_output.clone();
        let num_tiers = self.table.num_tiers();
        let metrics_handle = Arc::clone(&self.metrics);
        let periodic = try_with!(
            InterruptableThread::spawn(
                "periodic-metrics",
                Arc::clone(&self.shutdown),
                err_tx,
                move |table: &Arc<PageTable>, shutdown| {
                    let mut writer = PeriodicWriter::new(&periodic_output, num_tiers);
                    let mut last_tick = Instant::now();
                    loop {
                        if shutdown.wait_timeout(sample_rate) {
                            break;
                        }
                        let now = Instant::now();
                        writer.tick(
                            &metrics_handle,
                            table.occupancies(),
                            (now - last_tick).as_secs_f64(),
                        )?;
                        last_tick = now;
                    }
                    debug!("periodic metrics exiting");
                    Ok(())
                },
                Arc::clone(&self.table),
            ),
            "cannot spawn periodic metrics thread"
        );

        // wait until the manager saw every END or a worker reported failure
        loop {
            match err_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(()) => {
                    error!("a worker thread failed, shutting down");
                    self.shutdown.signal();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.is_set() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.shutdown.signal();

        let (manager_res, _) = try_with!(manager.join(), "manager join failed");
        let (scanner_res, _) = try_with!(scanner.join(), "scanner join failed");
        let (periodic_res, _) = try_with!(periodic.join(), "periodic join failed");
        manager_res?;
        scanner_res?;
        periodic_res?;
        info!("all threads exited, server shutdown complete");
        Ok(())
    }
}

/// Dispatch one request: END flips the client's done flag and triggers
/// shutdown once every flag is set; READ/WRITE are translated to a global
/// page id and passed to the page table.
fn handle_request(
    ctx: &ManagerCtx,
    spans: &[ClientSpan],
    done: &mut [bool],
    shutdown: &Shutdown,
    msg: AccessRequest,
) {
    let span = match spans.get(msg.client_id) {
        Some(span) => *span,
        None => {
            warn!("request from unknown client: {}", msg);
            return;
        }
    };
    if msg.op == Operation::End {
        if !done[msg.client_id] {
            done[msg.client_id] = true;
            debug!("client {} sent END", msg.client_id);
        }
        if done.iter().all(|d| *d) {
            info!("all clients sent END");
            shutdown.signal();
        }
        return;
    }
    if msg.page_offset >= span.pages {
        warn!("request outside client address space: {}", msg);
        return;
    }
    ctx.table.access(span.base + msg.page_offset, msg.op);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, Pattern, ServerConfig};
    use crate::metrics::DEFAULT_QUANTILES;
    use crate::policy::Policy;

    /// Capacities equal to the requested loads: every tier is full, so the
    /// scanner cannot move anything and the test is deterministic.
    fn test_config(
        clients: Vec<ClientConfig>,
        capacities: [usize; TIER_COUNT],
        dir: &std::path::Path,
    ) -> Config {
        Config {
            buffer_size: 64,
            server: ServerConfig {
                num_tiers: 3,
                capacities,
            },
            clients,
            zipf_skew: 0.99,
            running_time_secs: 1.0,
            read_ratio: 1.0,
            sample_rate_secs: 5.0,
            policy: Policy::Lru {
                hot_ms: 100,
                cold_ms: 1_000_000,
            },
            scan_interval_secs: 60.0,
            cache_ring: false,
            output: dir.join("latency.csv"),
            periodic_output: dir.join("periodic.csv"),
        }
    }

    fn client(tier_sizes: Vec<usize>) -> ClientConfig {
        ClientConfig {
            pattern: Pattern::Uniform,
            tier_sizes,
        }
    }

    #[test]
    fn all_ends_shut_the_server_down() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let config = test_config(
            vec![client(vec![2, 0, 0]), client(vec![1, 0, 1])],
            [3, 0, 1],
            dir.path(),
        );
        let metrics = Arc::new(Metrics::new(&DEFAULT_QUANTILES));
        let buffer = Arc::new(RingBuffer::new(config.buffer_size));
        let server =
            Server::new(&config, Arc::clone(&metrics), Arc::clone(&buffer)).expect("init failed");
        assert_eq!(server.total_pages(), 4);

        // client 1's pages start after client 0's two pages
        let requests = [
            AccessRequest {
                client_id: 0,
                page_offset: 0,
                op: Operation::Read,
            },
            AccessRequest {
                client_id: 0,
                page_offset: 1,
                op: Operation::Write,
            },
            AccessRequest {
                client_id: 1,
                page_offset: 1,
                op: Operation::Read,
            },
            AccessRequest {
                client_id: 0,
                page_offset: 0,
                op: Operation::End,
            },
            AccessRequest {
                client_id: 1,
                page_offset: 0,
                op: Operation::End,
            },
        ];
        for r in requests.iter() {
            buffer.push(*r).expect("buffer full");
        }

        server.run().expect("server failed");
        assert!(server.shutdown_handle().is_set());

        // END markers are not accesses; client 1 offset 1 is its PMEM page
        let snap = metrics.snapshot();
        assert_eq!(snap.total_access(), 3);
        assert_eq!(snap.local_access, 2);
        assert_eq!(snap.pmem_access, 1);
        assert_eq!(server.occupancies().iter().sum::<usize>(), 4);
    }

    #[test]
    fn malformed_requests_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let config = test_config(vec![client(vec![1, 0, 0])], [1, 0, 0], dir.path());
        let metrics = Arc::new(Metrics::new(&DEFAULT_QUANTILES));
        let buffer = Arc::new(RingBuffer::new(config.buffer_size));
        let server =
            Server::new(&config, Arc::clone(&metrics), Arc::clone(&buffer)).expect("init failed");

        let requests = [
            // unknown client
            AccessRequest {
                client_id: 9,
                page_offset: 0,
                op: Operation::Read,
            },
            // offset beyond the client's address space
            AccessRequest {
                client_id: 0,
                page_offset: 5,
                op: Operation::Read,
            },
            AccessRequest {
                client_id: 0,
                page_offset: 0,
                op: Operation::End,
            },
        ];
        for r in requests.iter() {
            buffer.push(*r).expect("buffer full");
        }

        server.run().expect("server failed");
        assert_eq!(metrics.snapshot().total_access(), 0);
    }

    #[test]
    fn duplicate_end_from_one_client_does_not_finish_the_run() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let config = test_config(
            vec![client(vec![1, 0, 0]), client(vec![1, 0, 0])],
            [2, 0, 0],
            dir.path(),
        );
        let metrics = Arc::new(Metrics::new(&DEFAULT_QUANTILES));
        let buffer = Arc::new(RingBuffer::new(config.buffer_size));
        let server =
            Server::new(&config, Arc::clone(&metrics), Arc::clone(&buffer)).expect("init failed");

        let end0 = AccessRequest {
            client_id: 0,
            page_offset: 0,
            op: Operation::End,
        };
        let end1 = AccessRequest {
            client_id: 1,
            page_offset: 0,
            op: Operation::End,
        };
        buffer.push(end0).expect("buffer full");
        buffer.push(end0).expect("buffer full");

        let server = Arc::new(server);
        let runner = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || server.run())
        };
        // two ENDs from the same client must not complete the run
        std::thread::sleep(Duration::from_millis(100));
        assert!(!server.shutdown_handle().is_set());

        buffer.push(end1).expect("buffer full");
        runner
            .join()
            .expect("runner panicked")
            .expect("server failed");
        assert!(server.shutdown_handle().is_set());
    }
}
