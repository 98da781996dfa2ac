//! Resource monitor: local CPU, memory and cloud round-trip health.
//!
//! A sampler task refreshes the snapshot on a fixed interval and publishes
//! it on a `watch` channel. Readers never block: `snapshot()` borrows the
//! latest value and annotates it as stale when sampling failed or the value
//! is older than the staleness bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use edgeline_core::config::MonitorConfig;

const NO_RTT: u64 = u64::MAX;

/// Point-in-time view of local resources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    /// Last cloud heartbeat round trip, if one has succeeded.
    pub network_rtt_ms: Option<u64>,
    pub age_ms: u64,
    pub stale: bool,
    pub saturated: bool,
}

impl ResourceSnapshot {
    /// Fraction of CPU still free, used to scale on-node agents.
    pub fn headroom(&self) -> f64 {
        (1.0 - self.cpu_utilization).clamp(0.0, 1.0)
    }

    /// Headroom as 0..=100, for heartbeats.
    pub fn health_pct(&self) -> u8 {
        (self.headroom() * 100.0).round() as u8
    }
}

/// Raw utilization reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Utilization {
    pub cpu: f64,
    pub memory: f64,
}

/// Source of utilization readings.
pub trait Sampler: Send + 'static {
    fn sample(&mut self) -> anyhow::Result<Utilization>;
}

#[derive(Debug, Clone)]
struct Sample {
    cpu: f64,
    memory: f64,
    at: Instant,
    failed: bool,
}

/// Read side of the monitor. Cheap to clone.
#[derive(Clone)]
pub struct ResourceMonitor {
    rx: watch::Receiver<Sample>,
    rtt_ms: Arc<AtomicU64>,
    stale_after: Duration,
    saturation_threshold: f64,
}

/// Write side, owned by the sampling loop.
pub struct MonitorTask {
    tx: watch::Sender<Sample>,
    interval: Duration,
}

impl ResourceMonitor {
    pub fn new(settings: &MonitorConfig) -> (Self, MonitorTask) {
        // Nothing sampled yet: reported stale until the first reading lands.
        let (tx, rx) = watch::channel(Sample {
            cpu: 0.0,
            memory: 0.0,
            at: Instant::now(),
            failed: true,
        });
        let monitor = Self {
            rx,
            rtt_ms: Arc::new(AtomicU64::new(NO_RTT)),
            stale_after: Duration::from_millis(settings.stale_after_ms),
            saturation_threshold: settings.saturation_threshold,
        };
        let task = MonitorTask {
            tx,
            interval: Duration::from_millis(settings.sample_interval_ms),
        };
        (monitor, task)
    }

    /// Latest snapshot. Never blocks on sampling.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let sample = self.rx.borrow().clone();
        let age = Instant::now().saturating_duration_since(sample.at);
        let rtt = self.rtt_ms.load(Ordering::Relaxed);
        ResourceSnapshot {
            cpu_utilization: sample.cpu,
            memory_utilization: sample.memory,
            network_rtt_ms: (rtt != NO_RTT).then_some(rtt),
            age_ms: age.as_millis() as u64,
            stale: sample.failed || age > self.stale_after,
            saturated: sample.cpu >= self.saturation_threshold
                || sample.memory >= self.saturation_threshold,
        }
    }

    /// Record a successful cloud round trip.
    pub fn record_rtt(&self, rtt: Duration) {
        self.rtt_ms.store(rtt.as_millis() as u64, Ordering::Relaxed);
    }
}

impl MonitorTask {
    /// Take one reading and publish it. On failure the previous values are
    /// kept and flagged.
    pub fn sample_once(&mut self, sampler: &mut impl Sampler) {
        match sampler.sample() {
            Ok(u) => {
                self.tx.send_replace(Sample {
                    cpu: u.cpu.clamp(0.0, 1.0),
                    memory: u.memory.clamp(0.0, 1.0),
                    at: Instant::now(),
                    failed: false,
                });
            }
            Err(e) => {
                tracing::debug!(error = %e, "resource sampling failed");
                self.tx.send_modify(|s| s.failed = true);
            }
        }
    }

    /// Runs forever, sampling every interval.
    pub async fn run(mut self, mut sampler: impl Sampler) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "resource monitor started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.sample_once(&mut sampler);
        }
    }
}

// ── Samplers ──────────────────────────────────────────────────────────────────

/// Reads the 1-minute load average and `sysinfo` memory counters.
pub struct LinuxSampler {
    cpus: f64,
}

impl LinuxSampler {
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        Self { cpus }
    }
}

impl Default for LinuxSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for LinuxSampler {
    #[cfg(target_os = "linux")]
    fn sample(&mut self) -> anyhow::Result<Utilization> {
        let mut loads = [0f64; 3];
        let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
        if n < 1 {
            anyhow::bail!("getloadavg returned {n}");
        }

        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        if unsafe { libc::sysinfo(&mut info) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let unit = info.mem_unit.max(1) as f64;
        let total = info.totalram as f64 * unit;
        let free = (info.freeram as f64 + info.bufferram as f64) * unit;
        if total <= 0.0 {
            anyhow::bail!("sysinfo reported zero total memory");
        }

        Ok(Utilization {
            cpu: (loads[0] / self.cpus).clamp(0.0, 1.0),
            memory: (1.0 - free / total).clamp(0.0, 1.0),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&mut self) -> anyhow::Result<Utilization> {
        anyhow::bail!("resource sampling is only implemented on linux")
    }
}

/// Test sampler. Clones share state, so a test can change readings or make
/// sampling fail while the monitor task owns another clone.
#[derive(Clone)]
pub struct FixedSampler {
    reading: Arc<Mutex<Option<Utilization>>>,
}

impl FixedSampler {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self {
            reading: Arc::new(Mutex::new(Some(Utilization { cpu, memory }))),
        }
    }

    pub fn set(&self, cpu: f64, memory: f64) {
        if let Ok(mut r) = self.reading.lock() {
            *r = Some(Utilization { cpu, memory });
        }
    }

    /// Subsequent samples fail until `set` is called again.
    pub fn fail(&self) {
        if let Ok(mut r) = self.reading.lock() {
            *r = None;
        }
    }
}

impl Sampler for FixedSampler {
    fn sample(&mut self) -> anyhow::Result<Utilization> {
        self.reading
            .lock()
            .map_err(|_| anyhow::anyhow!("sampler lock poisoned"))?
            .ok_or_else(|| anyhow::anyhow!("sampling disabled"))
    }
}
