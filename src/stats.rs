//! Client and server statistics.
//!
//! Counters are plain atomics updated on the request path; nothing here
//! takes a lock. Each client port also keeps a ring of recent
//! `(length, rtt)` samples. A sample is packed into one `u64` so a reader
//! never sees a length from one response paired with the RTT of another.
//!
//! The `Reporter` turns successive snapshots into rates and percentiles.

use crate::runtime::clock;
use crate::runtime::MessageHeader;
use chrono::Local;
use crossbeam_utils::CachePadded;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Default number of samples retained per client port.
pub const DEFAULT_RING_CAPACITY: usize = 500_000;

/// Default total number of samples used for percentiles across all ports.
pub const DEFAULT_CDF_SAMPLES: usize = 100_000;

/// Fixed-capacity ring of `(length, rtt)` pairs.
///
/// A slot holding 0 is empty; every real sample has a nonzero length.
pub struct SampleRing {
    slots: Box<[AtomicU64]>,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| AtomicU64::new(0)).collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn pack(length: u32, rtt: u32) -> u64 {
        (u64::from(length) << 32) | u64::from(rtt)
    }

    #[inline]
    fn unpack(word: u64) -> (u32, u32) {
        ((word >> 32) as u32, word as u32)
    }

    /// Store the sample with sequence number `seq`.
    pub fn store(&self, seq: u64, length: u32, rtt: u32) {
        let slot = (seq % self.slots.len() as u64) as usize;
        self.slots[slot].store(Self::pack(length, rtt), Ordering::Relaxed);
    }

    /// Sample with sequence number `seq`, if that slot has been written.
    pub fn get(&self, seq: u64) -> Option<(u32, u32)> {
        let slot = (seq % self.slots.len() as u64) as usize;
        match self.slots[slot].load(Ordering::Relaxed) {
            0 => None,
            word => Some(Self::unpack(word)),
        }
    }

    fn take(&self, seq: u64) -> Option<(u32, u32)> {
        let slot = (seq % self.slots.len() as u64) as usize;
        match self.slots[slot].swap(0, Ordering::Relaxed) {
            0 => None,
            word => Some(Self::unpack(word)),
        }
    }
}

/// Statistics for one client port.
pub struct ClientStats {
    total_requests: CachePadded<AtomicU64>,
    total_responses: CachePadded<AtomicU64>,
    response_bytes: CachePadded<AtomicU64>,
    total_rtt: CachePadded<AtomicU64>,
    lag: CachePadded<AtomicU64>,
    /// Requests issued to each server.
    requests: Box<[AtomicU64]>,
    /// Responses received from each server.
    responses: Box<[AtomicU64]>,
    ring: SampleRing,
}

impl ClientStats {
    pub fn new(num_servers: usize, ring_capacity: usize) -> Self {
        let counters = || -> Box<[AtomicU64]> {
            (0..num_servers).map(|_| AtomicU64::new(0)).collect()
        };
        Self {
            total_requests: CachePadded::new(AtomicU64::new(0)),
            total_responses: CachePadded::new(AtomicU64::new(0)),
            response_bytes: CachePadded::new(AtomicU64::new(0)),
            total_rtt: CachePadded::new(AtomicU64::new(0)),
            lag: CachePadded::new(AtomicU64::new(0)),
            requests: counters(),
            responses: counters(),
            ring: SampleRing::new(ring_capacity),
        }
    }

    pub fn record_issue(&self, server: usize) {
        self.requests[server].fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Release);
    }

    /// Record a response received at tick `end` (low 32 bits).
    pub fn record_response(&self, header: &MessageHeader, end: u32) {
        let rtt = clock::elapsed32(header.issue_time, end);
        self.record(header.length.max(1) as u32, rtt, header.server_id);
    }

    pub fn record(&self, length: u32, rtt: u32, server_id: i32) {
        let seq = self.total_responses.fetch_add(1, Ordering::AcqRel);
        self.response_bytes
            .fetch_add(u64::from(length), Ordering::Relaxed);
        self.total_rtt.fetch_add(u64::from(rtt), Ordering::Relaxed);
        match usize::try_from(server_id)
            .ok()
            .and_then(|id| self.responses.get(id))
        {
            Some(counter) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            None => warn!(server_id, "Response names an unknown server"),
        }
        self.ring.store(seq, length, rtt);
    }

    pub fn add_lag(&self, ticks: u64) {
        self.lag.fetch_add(ticks, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Acquire)
    }

    pub fn total_responses(&self) -> u64 {
        self.total_responses.load(Ordering::Acquire)
    }

    pub fn response_bytes(&self) -> u64 {
        self.response_bytes.load(Ordering::Relaxed)
    }

    pub fn total_rtt(&self) -> u64 {
        self.total_rtt.load(Ordering::Relaxed)
    }

    pub fn lag(&self) -> u64 {
        self.lag.load(Ordering::Relaxed)
    }

    /// Requests issued but not yet answered.
    pub fn outstanding(&self) -> u64 {
        let responses = self.total_responses();
        self.total_requests().saturating_sub(responses)
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Append the RTTs of up to `max` most recent samples to `out`.
    ///
    /// Sampling races with writers: a response counted in `total_responses`
    /// whose pair is not stored yet leaves its slot holding the sample from
    /// one lap earlier (or empty, which is skipped). Either way every value
    /// read is a real measurement, so percentiles are unaffected beyond
    /// which samples they draw from.
    pub fn recent_rtts(&self, max: usize, out: &mut Vec<u64>) {
        let total = self.total_responses();
        let count = (max as u64).min(total).min(self.ring.capacity() as u64);
        for seq in (total - count)..total {
            if let Some((_, rtt)) = self.ring.get(seq) {
                out.push(u64::from(rtt));
            }
        }
    }

    /// Remove and return every retained sample, oldest first.
    pub fn drain_samples(&self) -> Vec<(u32, u32)> {
        let total = self.total_responses();
        let count = total.min(self.ring.capacity() as u64);
        ((total - count)..total)
            .filter_map(|seq| self.ring.take(seq))
            .collect()
    }

    /// Per-server `(server, issued - completed)` for servers with requests
    /// still unanswered.
    pub fn incomplete(&self) -> Vec<(usize, u64)> {
        self.requests
            .iter()
            .zip(self.responses.iter())
            .enumerate()
            .filter_map(|(server, (issued, completed))| {
                let missing = issued
                    .load(Ordering::Relaxed)
                    .saturating_sub(completed.load(Ordering::Relaxed));
                (missing > 0).then_some((server, missing))
            })
            .collect()
    }
}

/// Request counters for one server worker (or one server port for the
/// stream transport, where workers share a connection table).
#[derive(Default)]
pub struct ServerMetrics {
    requests: CachePadded<AtomicU64>,
    bytes: CachePadded<AtomicU64>,
}

impl ServerMetrics {
    pub fn record(&self, length: usize) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(length as u64, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Median, 99th and 99.9th percentile ranks as exact fractions.
const P50: (usize, usize) = (1, 2);
const P99: (usize, usize) = (99, 100);
const P999: (usize, usize) = (999, 1000);

/// Index of the `num/den` percentile in `count` sorted samples:
/// `floor(count * num / den)`.
pub fn percentile_rank(count: usize, (num, den): (usize, usize)) -> usize {
    count * num / den
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub p50: u64,
    pub p99: u64,
    pub p999: u64,
}

/// Percentiles of `samples`, which is sorted in place.
pub fn percentiles(samples: &mut [u64]) -> Option<Percentiles> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();
    let n = samples.len();
    Some(Percentiles {
        p50: samples[percentile_rank(n, P50)],
        p99: samples[percentile_rank(n, P99)],
        p999: samples[percentile_rank(n, P999)],
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerReport {
    pub kops: f64,
    pub mbps: f64,
    pub avg_length: f64,
    /// Requests handled by each server port since the last report.
    pub per_server: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientReport {
    pub kops: f64,
    pub mbps: f64,
    /// RTT percentiles in microseconds.
    pub rtt_us: Option<(f64, f64, f64)>,
    /// Mean RTT in microseconds over every response in the interval.
    pub avg_rtt_us: f64,
    pub avg_length: f64,
    /// Fraction of elapsed time the senders spent behind schedule.
    pub lag_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Report {
    pub server: Option<ServerReport>,
    pub client: Option<ClientReport>,
    pub outstanding: u64,
}

/// Computes periodic reports from cumulative counters.
pub struct Reporter {
    cdf_samples: usize,
    last_time: Option<u64>,
    last_client_rpcs: u64,
    last_client_bytes: u64,
    last_lag: u64,
    last_rtt: u64,
    last_server_rpcs: u64,
    last_server_bytes: u64,
    last_per_server: Vec<u64>,
    scratch: Vec<u64>,
}

impl Reporter {
    pub fn new(cdf_samples: usize) -> Self {
        Self {
            cdf_samples,
            last_time: None,
            last_client_rpcs: 0,
            last_client_bytes: 0,
            last_lag: 0,
            last_rtt: 0,
            last_server_rpcs: 0,
            last_server_bytes: 0,
            last_per_server: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Forget previous totals, e.g. after roles were added or removed.
    pub fn reset(&mut self) {
        let cdf_samples = self.cdf_samples;
        *self = Self::new(cdf_samples);
    }

    /// Produce a report for the interval ending at tick `now`.
    ///
    /// `servers` holds, for each server port, the metrics of its workers.
    /// The first call only records a baseline and returns `None`.
    pub fn report(
        &mut self,
        now: u64,
        clients: &[&ClientStats],
        servers: &[Vec<&ServerMetrics>],
    ) -> Option<Report> {
        let mut server_rpcs = 0;
        let mut server_bytes = 0;
        let per_server: Vec<u64> = servers
            .iter()
            .map(|workers| {
                let rpcs: u64 = workers.iter().map(|m| m.requests()).sum();
                server_rpcs += rpcs;
                server_bytes += workers.iter().map(|m| m.bytes()).sum::<u64>();
                rpcs
            })
            .collect();

        let mut client_rpcs = 0;
        let mut client_bytes = 0;
        let mut lag = 0;
        let mut rtt = 0;
        let mut outstanding = 0;
        for stats in clients {
            client_rpcs += stats.total_responses();
            client_bytes += stats.response_bytes();
            lag += stats.lag();
            rtt += stats.total_rtt();
            outstanding += stats.outstanding();
        }

        let previous = self.last_time.replace(now);
        let deltas = |last: &[u64]| -> Vec<u64> {
            per_server
                .iter()
                .enumerate()
                .map(|(i, &rpcs)| rpcs.saturating_sub(last.get(i).copied().unwrap_or(0)))
                .collect()
        };
        let per_server_delta = deltas(&self.last_per_server);

        let report = previous.map(|previous| {
            let elapsed = clock::to_seconds(now.saturating_sub(previous)).max(1e-9);
            let mut report = Report {
                outstanding,
                ..Default::default()
            };

            let rpcs = server_rpcs.saturating_sub(self.last_server_rpcs);
            if rpcs > 0 {
                let bytes = server_bytes.saturating_sub(self.last_server_bytes);
                report.server = Some(ServerReport {
                    kops: rpcs as f64 / elapsed / 1e3,
                    mbps: bytes as f64 / elapsed / 1e6,
                    avg_length: bytes as f64 / rpcs as f64,
                    per_server: per_server_delta,
                });
            }

            let rpcs = client_rpcs.saturating_sub(self.last_client_rpcs);
            if !clients.is_empty() && rpcs > 0 {
                let bytes = client_bytes.saturating_sub(self.last_client_bytes);
                let lag_ticks = lag.saturating_sub(self.last_lag);
                report.client = Some(ClientReport {
                    kops: rpcs as f64 / elapsed / 1e3,
                    mbps: bytes as f64 / elapsed / 1e6,
                    rtt_us: self.rtt_percentiles(clients),
                    avg_rtt_us: clock::to_micros(rtt.saturating_sub(self.last_rtt))
                        / rpcs as f64,
                    avg_length: bytes as f64 / rpcs as f64,
                    lag_fraction: clock::to_seconds(lag_ticks) / elapsed / clients.len() as f64,
                });
            }
            report
        });

        self.last_client_rpcs = client_rpcs;
        self.last_client_bytes = client_bytes;
        self.last_lag = lag;
        self.last_rtt = rtt;
        self.last_server_rpcs = server_rpcs;
        self.last_server_bytes = server_bytes;
        self.last_per_server = per_server;
        report
    }

    fn rtt_percentiles(&mut self, clients: &[&ClientStats]) -> Option<(f64, f64, f64)> {
        self.scratch.clear();
        for stats in clients {
            let per_client = (self.cdf_samples / clients.len()).min(stats.ring_capacity());
            stats.recent_rtts(per_client, &mut self.scratch);
        }
        percentiles(&mut self.scratch).map(|p| {
            (
                clock::to_micros(p.p50),
                clock::to_micros(p.p99),
                clock::to_micros(p.p999),
            )
        })
    }
}

/// Parameters printed at the top of a round-trip time dump.
#[derive(Debug, Clone)]
pub struct DumpInfo {
    pub protocol: String,
    pub workload: String,
    pub net_bw: f64,
    pub threads: usize,
    pub server_nodes: usize,
    pub server_ports: usize,
    pub client_max: u32,
}

/// Write every retained sample of every client port to `path`, emptying the
/// rings. Returns the number of samples written.
pub fn dump_times(path: &Path, info: &DumpInfo, clients: &[&ClientStats]) -> io::Result<usize> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(
        out,
        "# Round-trip times measured by rpc-bench at {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    writeln!(
        out,
        "# --protocol {}, --workload {}, --net-bw {:.1} --threads {},",
        info.protocol, info.workload, info.net_bw, info.threads
    )?;
    writeln!(
        out,
        "# --server-nodes {} --server-ports {}, --client-max {}",
        info.server_nodes, info.server_ports, info.client_max
    )?;
    writeln!(out, "# Length   RTT (usec)")?;

    let mut written = 0;
    for stats in clients {
        for (length, rtt) in stats.drain_samples() {
            writeln!(out, "{:8} {:12.2}", length, clock::to_micros(u64::from(rtt)))?;
            written += 1;
        }
    }
    out.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ring_keeps_last_capacity_samples() {
        let stats = ClientStats::new(2, 8);
        for i in 0..20u32 {
            stats.record(100 + i, 1000 * (i + 1), (i % 2) as i32);
        }
        assert_eq!(stats.total_responses(), 20);

        let samples = stats.drain_samples();
        let expected: Vec<(u32, u32)> = (12..20u32).map(|i| (100 + i, 1000 * (i + 1))).collect();
        assert_eq!(samples, expected);

        // Draining empties the ring.
        assert!(stats.drain_samples().is_empty());
    }

    #[test]
    fn test_ring_partial_fill() {
        let stats = ClientStats::new(1, 100);
        for i in 0..5u32 {
            stats.record(16, i + 1, 0);
        }
        let mut rtts = Vec::new();
        stats.recent_rtts(3, &mut rtts);
        assert_eq!(rtts, vec![3, 4, 5]);
        assert_eq!(stats.drain_samples().len(), 5);
    }

    #[test]
    fn test_concurrent_writers_keep_pairs_intact() {
        const THREADS: u32 = 4;
        const PER_THREAD: u32 = 5000;
        const CAPACITY: usize = 1024;

        let stats = Arc::new(ClientStats::new(THREADS as usize, CAPACITY));
        let writers: Vec<_> = (1..=THREADS)
            .map(|t| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        let length = (t << 16) | i;
                        stats.record(length, length.wrapping_mul(3) + 1, (t - 1) as i32);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(stats.total_responses(), u64::from(THREADS * PER_THREAD));

        let samples = stats.drain_samples();
        assert_eq!(samples.len(), CAPACITY);
        assert!(samples
            .iter()
            .all(|&(length, rtt)| rtt == length.wrapping_mul(3) + 1));
        let mut lengths: Vec<u32> = samples.iter().map(|&(length, _)| length).collect();
        lengths.sort_unstable();
        lengths.dedup();
        assert_eq!(lengths.len(), CAPACITY);
    }

    #[test]
    fn test_record_response_uses_wrapping_rtt() {
        let stats = ClientStats::new(1, 4);
        let header = MessageHeader {
            length: 64,
            issue_time: u32::MAX - 9,
            server_id: 0,
            message_id: 1,
        };
        stats.record_response(&header, 10);
        assert_eq!(stats.total_rtt(), 20);
        assert_eq!(stats.response_bytes(), 64);
        assert_eq!(stats.drain_samples(), vec![(64, 20)]);
    }

    #[test]
    fn test_outstanding_and_incomplete() {
        let stats = ClientStats::new(3, 4);
        stats.record_issue(0);
        stats.record_issue(0);
        stats.record_issue(2);
        stats.record(16, 5, 0);
        assert_eq!(stats.outstanding(), 2);
        assert_eq!(stats.incomplete(), vec![(0, 1), (2, 1)]);

        // Out-of-range server ids still count as responses.
        stats.record(16, 5, 7);
        assert_eq!(stats.outstanding(), 1);
    }

    #[test]
    fn test_percentile_ranks() {
        assert_eq!(percentile_rank(1000, P50), 500);
        assert_eq!(percentile_rank(1000, P99), 990);
        assert_eq!(percentile_rank(1000, P999), 999);
        assert_eq!(percentile_rank(1, P999), 0);
        assert_eq!(percentile_rank(7, P99), 6);
    }

    #[test]
    fn test_percentiles_of_sequence() {
        let mut samples: Vec<u64> = (1..=1000).rev().collect();
        let p = percentiles(&mut samples).unwrap();
        assert_eq!(p.p50, 501);
        assert_eq!(p.p99, 991);
        assert_eq!(p.p999, 1000);
        assert!(percentiles(&mut []).is_none());
    }

    #[test]
    fn test_reporter_rates() {
        let stats = ClientStats::new(1, 1000);
        let metrics = ServerMetrics::default();
        let mut reporter = Reporter::new(1000);

        assert!(reporter
            .report(0, &[&stats], &[vec![&metrics]])
            .is_none());

        for _ in 0..2000 {
            stats.record_issue(0);
            stats.record(500, 10_000, 0);
            metrics.record(500);
        }
        stats.add_lag(100_000_000);

        let report = reporter
            .report(1_000_000_000, &[&stats], &[vec![&metrics]])
            .unwrap();
        let server = report.server.unwrap();
        assert!((server.kops - 2.0).abs() < 1e-9);
        assert!((server.mbps - 1.0).abs() < 1e-9);
        assert_eq!(server.per_server, vec![2000]);

        let client = report.client.unwrap();
        assert!((client.kops - 2.0).abs() < 1e-9);
        assert!((client.avg_length - 500.0).abs() < 1e-9);
        assert_eq!(client.rtt_us, Some((10.0, 10.0, 10.0)));
        assert!((client.avg_rtt_us - 10.0).abs() < 1e-9);
        assert!((client.lag_fraction - 0.1).abs() < 1e-9);
        assert_eq!(report.outstanding, 0);

        // Nothing new since the last report.
        let report = reporter
            .report(2_000_000_000, &[&stats], &[vec![&metrics]])
            .unwrap();
        assert!(report.server.is_none());
        assert!(report.client.is_none());
    }

    #[test]
    fn test_dump_times_format() {
        let stats = ClientStats::new(1, 16);
        stats.record(100, 1500, 0);
        stats.record(2000, 25_250, 0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtts.txt");
        let info = DumpInfo {
            protocol: "stream".into(),
            workload: "100".into(),
            net_bw: 0.0,
            threads: 1,
            server_nodes: 1,
            server_ports: 1,
            client_max: 200,
        };
        assert_eq!(dump_times(&path, &info, &[&stats]).unwrap(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines[0].starts_with("# Round-trip times measured by rpc-bench at "));
        assert_eq!(
            lines[1],
            "# --protocol stream, --workload 100, --net-bw 0.0 --threads 1,"
        );
        assert_eq!(lines[2], "# --server-nodes 1 --server-ports 1, --client-max 200");
        assert_eq!(lines[3], "# Length   RTT (usec)");
        assert_eq!(lines[4], "     100         1.50");
        assert_eq!(lines[5], "    2000        25.25");

        // Dumped samples are gone.
        assert!(stats.drain_samples().is_empty());
    }
}
