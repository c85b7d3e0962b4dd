use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);

/// Rolling byte-rate over the last `window` of samples.
#[derive(Debug)]
pub struct SpeedMonitor {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl Default for SpeedMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl SpeedMonitor {
    pub fn new(window: Duration) -> Self {
        Self { window, samples: VecDeque::new(), total: 0 }
    }

    pub fn compute(&mut self, bytes: u64) {
        self.compute_at(bytes, Instant::now());
    }

    pub fn compute_at(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back((now, bytes));
        self.total += bytes;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.total -= bytes;
        }
    }

    pub fn bytes_per_sec_at(&mut self, now: Instant) -> u64 {
        self.evict(now);
        let secs = self.window.as_secs_f64();
        (self.total as f64 / secs) as u64
    }

    pub fn speed(&mut self) -> String {
        self.speed_at(Instant::now())
    }

    pub fn speed_at(&mut self, now: Instant) -> String {
        format!("{}/s", fmt_bytes(self.bytes_per_sec_at(now)))
    }
}

pub fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
