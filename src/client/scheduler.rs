//! Open-loop request scheduling for one client port.
//!
//! Server choices, lengths and inter-arrival gaps are drawn up front into
//! three fixed sequences whose sizes are distinct primes, so cycling through
//! them in lock step takes a very long time to repeat a combination. Issue
//! times advance by the sampled gap from the previous *scheduled* time, not
//! from when the request actually went out; falling behind is measured as
//! lag, never caught up by skipping.

use crate::runtime::HEADER_LEN;
use crate::workload::Workload;
use rand::Rng;
use rand_distr::{Distribution, Exp};

pub const SERVER_SEQUENCE_LEN: usize = 4729;
pub const LENGTH_SEQUENCE_LEN: usize = 7207;
pub const INTERVAL_SEQUENCE_LEN: usize = 8783;

/// Precomputed request parameters.
#[derive(Debug, Clone)]
pub struct RequestSequences {
    pub servers: Vec<usize>,
    pub lengths: Vec<i32>,
    /// Gaps between consecutive issue times, in ticks.
    pub intervals: Vec<u64>,
}

impl RequestSequences {
    /// Draw the sequences for a port spreading requests over `num_servers`.
    ///
    /// `rate` is the target request rate of this port in requests per
    /// second; `None` (or a non-positive rate) issues back to back, bounded
    /// only by the outstanding cap.
    pub fn generate<R: Rng + ?Sized>(
        num_servers: usize,
        workload: &Workload,
        rate: Option<f64>,
        rng: &mut R,
    ) -> Self {
        let servers = (0..SERVER_SEQUENCE_LEN)
            .map(|_| rng.gen_range(0..num_servers.max(1)))
            .collect();
        let lengths = workload.sample(LENGTH_SEQUENCE_LEN, rng);
        let intervals = match rate.filter(|&r| r > 0.0).and_then(|r| Exp::new(r).ok()) {
            Some(exp) => (0..INTERVAL_SEQUENCE_LEN)
                .map(|_| (exp.sample(rng) * 1e9) as u64)
                .collect(),
            _ => vec![0],
        };
        Self {
            servers,
            lengths,
            intervals,
        }
    }

    /// Average request length after clamping to `[16, max_length]`.
    pub fn average_length(&self, max_length: i32) -> f64 {
        let total: f64 = self
            .lengths
            .iter()
            .map(|&len| clamp_length(len, max_length).0 as f64)
            .sum();
        total / self.lengths.len().max(1) as f64
    }
}

/// Clamp a length to at least a header and at most `max`; reports whether
/// the length was truncated.
pub fn clamp_length(length: i32, max: i32) -> (i32, bool) {
    let length = length.max(HEADER_LEN as i32);
    if length > max {
        (max, true)
    } else {
        (length, false)
    }
}

/// Target and length of the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub server: usize,
    pub length: i32,
}

pub struct Scheduler {
    sequences: RequestSequences,
    next_server: usize,
    next_length: usize,
    next_interval: usize,
    next_issue: u64,
    cap: u64,
    max_length: i32,
}

impl Scheduler {
    /// `cap` bounds outstanding requests; the first request is due at
    /// `start`. Lengths are clamped to `[16, max_length]`.
    pub fn new(sequences: RequestSequences, cap: u64, max_length: i32, start: u64) -> Self {
        Self {
            sequences,
            next_server: 0,
            next_length: 0,
            next_interval: 0,
            next_issue: start,
            cap: cap.max(1),
            max_length,
        }
    }

    /// Whether a request may go out at `now` given the port's counters.
    #[inline]
    pub fn ready(&self, now: u64, issued: u64, completed: u64) -> bool {
        now >= self.next_issue && issued.saturating_sub(completed) < self.cap
    }

    /// Advance the server and length cursors.
    pub fn select(&mut self) -> Selection {
        let server = self.sequences.servers[self.next_server];
        self.next_server = (self.next_server + 1) % self.sequences.servers.len();

        let raw = self.sequences.lengths[self.next_length];
        self.next_length = (self.next_length + 1) % self.sequences.lengths.len();

        Selection {
            server,
            length: clamp_length(raw, self.max_length).0,
        }
    }

    /// Move the next issue time forward by one interval. Returns how far
    /// `now` is already past the new issue time (0 if not behind).
    pub fn reschedule(&mut self, now: u64) -> u64 {
        self.next_issue += self.sequences.intervals[self.next_interval];
        self.next_interval = (self.next_interval + 1) % self.sequences.intervals.len();
        now.saturating_sub(self.next_issue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sequences(servers: Vec<usize>, lengths: Vec<i32>, intervals: Vec<u64>) -> RequestSequences {
        RequestSequences {
            servers,
            lengths,
            intervals,
        }
    }

    #[test]
    fn test_generate_sizes_and_ranges() {
        let mut rng = StdRng::seed_from_u64(3);
        let seq = RequestSequences::generate(5, &Workload::Fixed(100), Some(1e6), &mut rng);
        assert_eq!(seq.servers.len(), SERVER_SEQUENCE_LEN);
        assert_eq!(seq.lengths.len(), LENGTH_SEQUENCE_LEN);
        assert_eq!(seq.intervals.len(), INTERVAL_SEQUENCE_LEN);
        assert!(seq.servers.iter().all(|&s| s < 5));

        // Mean gap of 1 µs at one million requests per second.
        let mean = seq.intervals.iter().sum::<u64>() as f64 / seq.intervals.len() as f64;
        assert!((mean - 1000.0).abs() < 100.0, "mean interval {mean}");
    }

    #[test]
    fn test_zero_rate_is_back_to_back() {
        let mut rng = StdRng::seed_from_u64(3);
        let seq = RequestSequences::generate(2, &Workload::Fixed(100), None, &mut rng);
        assert_eq!(seq.intervals, vec![0]);
        let seq = RequestSequences::generate(2, &Workload::Fixed(100), Some(0.0), &mut rng);
        assert_eq!(seq.intervals, vec![0]);
    }

    #[test]
    fn test_clamp_length() {
        assert_eq!(clamp_length(4, i32::MAX), (16, false));
        assert_eq!(clamp_length(5000, 1000), (1000, true));
        assert_eq!(clamp_length(500, 1000), (500, false));
        assert_eq!(clamp_length(5000, i32::MAX), (5000, false));
    }

    #[test]
    fn test_cursors_cycle_independently() {
        let seq = sequences(vec![0, 1], vec![100, 200, 300], vec![0]);
        let mut sched = Scheduler::new(seq, 1, i32::MAX, 0);
        let picks: Vec<_> = (0..6).map(|_| sched.select()).collect();
        let servers: Vec<_> = picks.iter().map(|s| s.server).collect();
        let lengths: Vec<_> = picks.iter().map(|s| s.length).collect();
        assert_eq!(servers, vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(lengths, vec![100, 200, 300, 100, 200, 300]);
    }

    #[test]
    fn test_reschedule_accumulates_from_schedule_not_now() {
        let seq = sequences(vec![0], vec![100], vec![1000, 3000]);
        let mut sched = Scheduler::new(seq, 4, i32::MAX, 10_000);

        assert!(!sched.ready(9_999, 0, 0));
        assert!(sched.ready(10_000, 0, 0));

        // Issued late at 12,500: next issue is 11,000, already 1,500 behind.
        assert_eq!(sched.reschedule(12_500), 1_500);
        assert_eq!(sched.next_issue, 11_000);
        // Next gap is 3,000: due at 14,000, not behind.
        assert_eq!(sched.reschedule(12_600), 0);
        assert_eq!(sched.next_issue, 14_000);
    }

    #[test]
    fn test_ready_respects_cap() {
        let seq = sequences(vec![0], vec![100], vec![0]);
        let sched = Scheduler::new(seq, 3, i32::MAX, 0);
        assert!(sched.ready(5, 2, 0));
        assert!(!sched.ready(5, 3, 0));
        assert!(sched.ready(5, 3, 1));
    }

    #[test]
    fn test_average_length_uses_clamped_values() {
        let seq = sequences(vec![0], vec![4, 100, 5000], vec![0]);
        assert_eq!(seq.average_length(1000), (16.0 + 100.0 + 1000.0) / 3.0);
    }
}
