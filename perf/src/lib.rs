use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tandem_icc::{Endpoint, IpcError, Result};

// ─── Statistics ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub median: u64,
    pub stddev: f64,
    pub p50: u64,
    pub p75: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    pub p9999: u64,
    pub count: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BenchResult {
    pub name: String,
    pub unit: String,
    pub stats: Stats,
}

pub fn compute_stats(samples: &mut [u64]) -> Stats {
    assert!(!samples.is_empty(), "cannot compute stats on empty samples");
    samples.sort_unstable();

    let count = samples.len();
    let sum: u64 = samples.iter().sum();
    let mean = sum as f64 / count as f64;

    let variance = samples
        .iter()
        .map(|&x| {
            let diff = x as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / count as f64;
    let stddev = variance.sqrt();

    Stats {
        min: samples[0],
        max: samples[count - 1],
        mean,
        median: percentile_sorted(samples, 50.0),
        stddev,
        p50: percentile_sorted(samples, 50.0),
        p75: percentile_sorted(samples, 75.0),
        p90: percentile_sorted(samples, 90.0),
        p95: percentile_sorted(samples, 95.0),
        p99: percentile_sorted(samples, 99.0),
        p999: percentile_sorted(samples, 99.9),
        p9999: percentile_sorted(samples, 99.99),
        count,
    }
}

fn percentile_sorted(sorted: &[u64], pct: f64) -> u64 {
    let len = sorted.len();
    if len == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0 * len as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(len - 1);
    sorted[idx]
}

// ─── Measurement Harness ────────────────────────────────────────────────────

/// Averages `batch_size` calls per sample. Suited to operations far below
/// timer resolution.
pub fn measure_batched<F: FnMut()>(
    name: &str,
    batches: usize,
    batch_size: usize,
    warmup: usize,
    mut f: F,
) -> BenchResult {
    for _ in 0..warmup * batch_size {
        f();
    }

    let mut samples = Vec::with_capacity(batches);
    for _ in 0..batches {
        let start = Instant::now();
        for _ in 0..batch_size {
            f();
        }
        let total = start.elapsed().as_nanos();
        let per_op = ((total + (batch_size as u128 / 2)) / batch_size as u128) as u64;
        samples.push(per_op.max(1));
    }

    BenchResult {
        name: name.to_string(),
        unit: "ns/op".to_string(),
        stats: compute_stats(&mut samples),
    }
}

/// Times every call on its own, keeping the tail visible.
pub fn measure_each<F: FnMut()>(name: &str, iterations: usize, warmup: usize, mut f: F) -> BenchResult {
    for _ in 0..warmup {
        f();
    }

    let mut samples = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let start = Instant::now();
        f();
        samples.push((start.elapsed().as_nanos() as u64).max(1));
    }

    BenchResult {
        name: name.to_string(),
        unit: "ns".to_string(),
        stats: compute_stats(&mut samples),
    }
}

// ─── Resource Usage ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceSnapshot {
    pub max_rss_bytes: i64,
    pub minor_faults: i64,
    pub major_faults: i64,
    pub vol_ctx_switches: i64,
    pub invol_ctx_switches: i64,
    pub user_time_us: i64,
    pub sys_time_us: i64,
}

pub fn capture_rusage() -> ResourceSnapshot {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    #[cfg(target_os = "linux")]
    let max_rss_bytes = usage.ru_maxrss * 1024;
    #[cfg(not(target_os = "linux"))]
    let max_rss_bytes = usage.ru_maxrss;
    ResourceSnapshot {
        max_rss_bytes,
        minor_faults: usage.ru_minflt,
        major_faults: usage.ru_majflt,
        vol_ctx_switches: usage.ru_nvcsw,
        invol_ctx_switches: usage.ru_nivcsw,
        user_time_us: usage.ru_utime.tv_sec * 1_000_000 + usage.ru_utime.tv_usec as i64,
        sys_time_us: usage.ru_stime.tv_sec * 1_000_000 + usage.ru_stime.tv_usec as i64,
    }
}

// ─── Channel Fixtures ───────────────────────────────────────────────────────

/// Channel id pair unique to this process and call.
///
/// Kept short: object names are capped at 31 bytes including the prefix.
pub fn unique_channel_ids(label: &str) -> (String, String) {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    (format!("b{label}{pid}-{n}c"), format!("b{label}{pid}-{n}s"))
}

/// Deterministic payload of `len` bytes.
pub fn make_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Server endpoint whose client, on a background thread, sends every message
/// straight back. An empty message stops the echo thread.
pub struct EchoPair {
    pub server: Endpoint,
    echo: Option<JoinHandle<Result<u64>>>,
}

impl EchoPair {
    pub fn start(label: &str, capacity: usize) -> Result<Self> {
        let (client_id, server_id) = unique_channel_ids(label);
        let server = Endpoint::builder()
            .capacity(capacity)
            .init(&client_id, &server_id)?;
        let mut client = Endpoint::connect(&client_id, &server_id)?;

        let echo = thread::spawn(move || {
            let mut buf = vec![0u8; client.inbound_capacity()];
            let mut echoed = 0u64;
            loop {
                let n = client.receive(&mut buf, Duration::from_secs(10))?;
                if n == 0 {
                    return Ok(echoed);
                }
                client.send(&buf[..n], Duration::from_secs(10))?;
                echoed += 1;
            }
        });

        Ok(Self {
            server,
            echo: Some(echo),
        })
    }

    /// One request/response through both channels. Returns the reply length.
    #[inline]
    pub fn round_trip(&mut self, payload: &[u8], reply: &mut [u8]) -> Result<usize> {
        self.server.send(payload, Duration::from_secs(10))?;
        self.server.receive(reply, Duration::from_secs(10))
    }

    /// Stops the echo thread and returns how many messages it echoed.
    pub fn finish(mut self) -> Result<u64> {
        self.stop()
    }

    fn stop(&mut self) -> Result<u64> {
        let Some(echo) = self.echo.take() else {
            return Ok(0);
        };
        self.server.send(&[], Duration::from_secs(10))?;
        echo.join().unwrap_or(Err(IpcError::Abandoned {
            name: "echo thread".into(),
        }))
    }
}

impl Drop for EchoPair {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ─── Display ────────────────────────────────────────────────────────────────

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_ns(ns: f64) -> String {
    let abs = ns.abs();
    if abs >= 1_000_000.0 {
        format!("{:.1} ms", ns / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{:.1} us", ns / 1_000.0)
    } else {
        format!("{:.0} ns", ns)
    }
}

pub fn print_result_row(r: &BenchResult) {
    println!(
        "  {:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  {}",
        r.name,
        r.stats.min,
        r.stats.p50,
        r.stats.p75,
        r.stats.p90,
        r.stats.p99,
        r.stats.p999,
        r.stats.max,
        r.unit,
    );
}

pub fn print_table_header() {
    println!(
        "  {:<30} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}  unit",
        "Benchmark", "min", "p50", "p75", "p90", "p99", "p99.9", "max",
    );
    println!("  {}", "─".repeat(100));
}

pub fn section_header(title: &str) {
    println!("\n{}", "─".repeat(90));
    println!("  {title}");
    println!("{}\n", "─".repeat(90));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_follow_nearest_rank() {
        let mut samples: Vec<u64> = (1..=100).rev().collect();
        let stats = compute_stats(&mut samples);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 100);
        assert_eq!(stats.p50, 50);
        assert_eq!(stats.p99, 99);
        assert_eq!(stats.count, 100);
        assert!((stats.mean - 50.5).abs() < f64::EPSILON);
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let stats = compute_stats(&mut [7]);
        assert_eq!((stats.min, stats.p50, stats.p9999, stats.max), (7, 7, 7, 7));
    }

    #[test]
    fn echo_pair_returns_the_payload() {
        let mut pair = EchoPair::start("t", 64).expect("start");
        let payload = make_payload(48);
        let mut reply = [0u8; 64];

        for _ in 0..10 {
            let n = pair.round_trip(&payload, &mut reply).expect("round trip");
            assert_eq!(&reply[..n], &payload[..]);
        }
        assert_eq!(pair.finish().expect("finish"), 10);
    }

    #[test]
    fn formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(4096), "4.0 KB");
        assert_eq!(format_ns(1_500.0), "1.5 us");
    }
}
