//! Process resource gauges.
//!
//! Samples this process's CPU share and resident memory with `sysinfo` on a
//! fixed period and publishes them through [`Metrics::set_process_usage`].

use crate::internal_metrics::Metrics;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SAMPLE_PERIOD: Duration = Duration::from_secs(10);

pub struct SystemCollector {
    sampler: System,
    metrics: Metrics,
    period: Duration,
}

impl SystemCollector {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            sampler: System::new(),
            metrics,
            period: SAMPLE_PERIOD,
        }
    }

    /// Samples once per period until `token` is cancelled or the process
    /// can no longer be inspected.
    pub async fn run(mut self, token: CancellationToken) {
        let own_pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(e) => {
                warn!(error = %e, "Cannot determine own PID; process metrics disabled");
                return;
            }
        };

        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.sample(own_pid) {
                warn!(pid = %own_pid, "Process disappeared from the process table; stopping process metrics");
                break;
            }
        }
        debug!("System collector stopped.");
    }

    /// Returns `false` once the process can no longer be found.
    fn sample(&mut self, pid: Pid) -> bool {
        self.sampler.refresh_cpu();
        if !self.sampler.refresh_process(pid) {
            return false;
        }
        match self.sampler.process(pid) {
            Some(process) => {
                self.metrics
                    .set_process_usage(f64::from(process.cpu_usage()), process.memory());
                true
            }
            None => false,
        }
    }
}
