//! Latency and quality telemetry rings
//!
//! Both rings share one temporal skeleton: a bounded chain of buckets,
//! newest first, where the head bucket is rolled once it has covered at
//! least `min_link_span` of wall time. Queries aggregate the buckets whose
//! spans intersect the requested window. Writes and reads are short and
//! lock-protected; rolling the head happens under the same lock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Chain geometry shared by both rings.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Max buckets kept in the chain.
    pub max_chain_link_n: usize,
    /// Minimum wall-time span of one bucket.
    pub min_chain_link_size: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            max_chain_link_n: 12,
            min_chain_link_size: Duration::from_secs(5),
        }
    }
}

struct LatencyBucket {
    created: Instant,
    sum: Duration,
    count: u64,
}

/// Rolling average of recorded durations over a bounded window.
pub struct LatencyRing {
    buckets: Mutex<VecDeque<LatencyBucket>>,
    config: RingConfig,
}

impl LatencyRing {
    pub fn new(config: RingConfig) -> Self {
        Self {
            buckets: Mutex::new(VecDeque::new()),
            config,
        }
    }

    pub fn record(&self, latency: Duration) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("ring lock poisoned");

        let roll = match buckets.front() {
            Some(head) => now.duration_since(head.created) >= self.config.min_chain_link_size,
            None => true,
        };
        if roll {
            buckets.push_front(LatencyBucket {
                created: now,
                sum: Duration::ZERO,
                count: 0,
            });
            buckets.truncate(self.config.max_chain_link_n.max(1));
        }

        let head = buckets.front_mut().expect("ring has a head after roll");
        head.sum += latency;
        head.count += 1;
    }

    /// Average latency across the buckets intersecting `[now - period, now]`.
    ///
    /// `bounds_ok` is false when the period exceeds what the chain can
    /// cover (`max_chain_link_n * min_chain_link_size`).
    pub fn average(&self, period: Duration) -> (Duration, bool) {
        let bounds_ok = period
            <= self.config.min_chain_link_size * self.config.max_chain_link_n.max(1) as u32;

        let now = Instant::now();
        let buckets = self.buckets.lock().expect("ring lock poisoned");

        let mut sum = Duration::ZERO;
        let mut count = 0u64;
        let mut newer_created = now;
        for bucket in buckets.iter() {
            // A bucket spans from its creation until the next newer bucket
            // was created (the head runs until now).
            let span_end = newer_created;
            newer_created = bucket.created;
            if now.duration_since(span_end) > period {
                break;
            }
            sum += bucket.sum;
            count += bucket.count;
        }

        let avg = if count == 0 {
            Duration::ZERO
        } else {
            sum / count as u32
        };
        (avg, bounds_ok)
    }
}

/// One request's quality observation.
#[derive(Debug, Clone, Copy)]
pub struct KnnObservation {
    pub latency: Duration,
    pub score: f64,
    /// `|results| / k`, clamped to `[0, 1]`.
    pub satisfaction: f64,
    pub failed: bool,
}

struct MonitorBucket {
    created: Instant,
    n: u64,
    n_failed: u64,
    sum_latency: Duration,
    sum_score: f64,
    sum_score_no_fails: f64,
    sum_satisfaction: f64,
}

/// Aggregated answer to a monitor query.
#[derive(Debug, Clone, Copy)]
pub struct MonitorStats {
    pub created: DateTime<Utc>,
    pub span: Duration,
    pub n: u64,
    pub n_failed: u64,
    pub avg_latency: Duration,
    pub avg_score: f64,
    pub avg_score_no_fails: f64,
    pub avg_satisfaction: f64,
}

/// Quality monitor ring: same skeleton as [`LatencyRing`], richer buckets.
pub struct KnnMonitorRing {
    buckets: Mutex<VecDeque<MonitorBucket>>,
    config: RingConfig,
}

impl KnnMonitorRing {
    pub fn new(config: RingConfig) -> Self {
        Self {
            buckets: Mutex::new(VecDeque::new()),
            config,
        }
    }

    pub fn record(&self, obs: KnnObservation) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("ring lock poisoned");

        let roll = match buckets.front() {
            Some(head) => now.duration_since(head.created) >= self.config.min_chain_link_size,
            None => true,
        };
        if roll {
            buckets.push_front(MonitorBucket {
                created: now,
                n: 0,
                n_failed: 0,
                sum_latency: Duration::ZERO,
                sum_score: 0.0,
                sum_score_no_fails: 0.0,
                sum_satisfaction: 0.0,
            });
            buckets.truncate(self.config.max_chain_link_n.max(1));
        }

        let head = buckets.front_mut().expect("ring has a head after roll");
        head.n += 1;
        head.sum_latency += obs.latency;
        head.sum_score += obs.score;
        head.sum_satisfaction += obs.satisfaction.clamp(0.0, 1.0);
        if obs.failed {
            head.n_failed += 1;
        } else {
            head.sum_score_no_fails += obs.score;
        }
    }

    /// Aggregate over the window `[now - start, now - end]`, `start >= end`.
    pub fn query(&self, start: Duration, end: Duration) -> MonitorStats {
        let (start, end) = if start >= end { (start, end) } else { (end, start) };
        let now = Instant::now();
        let wall_now = Utc::now();
        let buckets = self.buckets.lock().expect("ring lock poisoned");

        let mut n = 0u64;
        let mut n_failed = 0u64;
        let mut sum_latency = Duration::ZERO;
        let mut sum_score = 0.0;
        let mut sum_score_no_fails = 0.0;
        let mut sum_satisfaction = 0.0;
        let mut oldest_created: Option<Instant> = None;

        let mut newer_created = now;
        for bucket in buckets.iter() {
            let span_end = newer_created;
            newer_created = bucket.created;

            let age_end = now.duration_since(span_end);
            let age_start = now.duration_since(bucket.created);
            // Skip buckets entirely newer than the window, stop once past it.
            if age_start < end {
                continue;
            }
            if age_end > start {
                break;
            }

            n += bucket.n;
            n_failed += bucket.n_failed;
            sum_latency += bucket.sum_latency;
            sum_score += bucket.sum_score;
            sum_score_no_fails += bucket.sum_score_no_fails;
            sum_satisfaction += bucket.sum_satisfaction;
            oldest_created = Some(bucket.created);
        }

        let created = match oldest_created {
            Some(instant) => {
                wall_now - chrono::Duration::from_std(now.duration_since(instant))
                    .unwrap_or_else(|_| chrono::Duration::zero())
            }
            None => wall_now,
        };
        let span = oldest_created
            .map(|i| now.duration_since(i))
            .unwrap_or(Duration::ZERO);

        let ok = n - n_failed;
        MonitorStats {
            created,
            span,
            n,
            n_failed,
            avg_latency: if n == 0 {
                Duration::ZERO
            } else {
                sum_latency / n as u32
            },
            avg_score: if n == 0 { 0.0 } else { sum_score / n as f64 },
            avg_score_no_fails: if ok == 0 {
                0.0
            } else {
                sum_score_no_fails / ok as f64
            },
            avg_satisfaction: if n == 0 {
                0.0
            } else {
                sum_satisfaction / n as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(links: usize, span_ms: u64) -> RingConfig {
        RingConfig {
            max_chain_link_n: links,
            min_chain_link_size: Duration::from_millis(span_ms),
        }
    }

    #[test]
    fn test_latency_average_single_bucket() {
        let ring = LatencyRing::new(config(4, 1000));
        ring.record(Duration::from_millis(10));
        ring.record(Duration::from_millis(30));

        let (avg, bounds_ok) = ring.average(Duration::from_secs(1));
        assert_eq!(avg, Duration::from_millis(20));
        assert!(bounds_ok);
    }

    #[test]
    fn test_latency_bounds_check() {
        let ring = LatencyRing::new(config(4, 1000));
        let (_, bounds_ok) = ring.average(Duration::from_secs(5));
        assert!(!bounds_ok);
        let (_, bounds_ok) = ring.average(Duration::from_secs(4));
        assert!(bounds_ok);
    }

    #[test]
    fn test_latency_empty_ring() {
        let ring = LatencyRing::new(config(4, 1000));
        let (avg, _) = ring.average(Duration::from_secs(1));
        assert_eq!(avg, Duration::ZERO);
    }

    #[test]
    fn test_latency_head_rolls() {
        let ring = LatencyRing::new(config(2, 10));
        ring.record(Duration::from_millis(100));
        std::thread::sleep(Duration::from_millis(20));
        ring.record(Duration::from_millis(200));

        // Both buckets intersect a wide-enough window even though the
        // chain is bounded.
        let (avg, _) = ring.average(Duration::from_millis(20 * 2));
        assert_eq!(avg, Duration::from_millis(150));
    }

    #[test]
    fn test_latency_old_buckets_fall_out_of_period() {
        let ring = LatencyRing::new(config(8, 10));
        ring.record(Duration::from_millis(100));
        std::thread::sleep(Duration::from_millis(50));
        // Rolls a new head; the old bucket's span ends here.
        ring.record(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));

        let (avg, _) = ring.average(Duration::from_millis(5));
        assert_eq!(avg, Duration::from_millis(10));
    }

    #[test]
    fn test_monitor_aggregates() {
        let ring = KnnMonitorRing::new(config(4, 1000));
        ring.record(KnnObservation {
            latency: Duration::from_millis(10),
            score: 1.0,
            satisfaction: 1.0,
            failed: false,
        });
        ring.record(KnnObservation {
            latency: Duration::from_millis(30),
            score: 0.0,
            satisfaction: 0.0,
            failed: true,
        });

        let stats = ring.query(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(stats.n, 2);
        assert_eq!(stats.n_failed, 1);
        assert_eq!(stats.avg_latency, Duration::from_millis(20));
        assert!((stats.avg_score - 0.5).abs() < 1e-12);
        assert!((stats.avg_score_no_fails - 1.0).abs() < 1e-12);
        assert!((stats.avg_satisfaction - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_monitor_satisfaction_clamped() {
        let ring = KnnMonitorRing::new(config(4, 1000));
        ring.record(KnnObservation {
            latency: Duration::ZERO,
            score: 0.0,
            satisfaction: 7.0,
            failed: false,
        });
        let stats = ring.query(Duration::from_secs(1), Duration::ZERO);
        assert!((stats.avg_satisfaction - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_monitor_empty_window() {
        let ring = KnnMonitorRing::new(config(4, 1000));
        let stats = ring.query(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(stats.n, 0);
        assert_eq!(stats.span, Duration::ZERO);
    }
}
