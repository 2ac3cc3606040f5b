use std::collections::HashMap;
use std::time::Instant;

/// Observer for encode loop events.
///
/// Keeps the loop free of output concerns: the CLI reports through the
/// `log` crate, tests record or discard.
pub trait EncodeLogger: Send {
    /// Called once per loop iteration with the current counters.
    fn progress(&mut self, submitted: u64, emitted: u64);

    /// Record how long a named loop stage took for one iteration.
    fn timing(&mut self, stage: &str, duration_ms: f64);

    fn info(&mut self, message: &str);

    /// Emit an end-of-run summary. Default: no-op.
    fn summary(&self) {}
}

pub struct NullEncodeLogger;

impl EncodeLogger for NullEncodeLogger {
    fn progress(&mut self, _submitted: u64, _emitted: u64) {}
    fn timing(&mut self, _stage: &str, _duration_ms: f64) {}
    fn info(&mut self, _message: &str) {}
}

#[derive(Default)]
struct StageTotals {
    count: u64,
    total_ms: f64,
}

/// Logs throttled progress and a per-stage timing summary.
///
/// Only running totals are kept, since the loop may run indefinitely.
pub struct StdoutEncodeLogger {
    throttle_frames: u64,
    stages: HashMap<String, StageTotals>,
    start_time: Instant,
    submitted: u64,
    emitted: u64,
    last_reported: Option<u64>,
}

impl StdoutEncodeLogger {
    pub fn new(throttle_frames: u64) -> Self {
        Self {
            throttle_frames: throttle_frames.max(1),
            stages: HashMap::new(),
            start_time: Instant::now(),
            submitted: 0,
            emitted: 0,
            last_reported: None,
        }
    }

    /// Returns the formatted summary, or `None` if nothing was encoded.
    pub fn summary_string(&self) -> Option<String> {
        if self.stages.is_empty() && self.submitted == 0 {
            return None;
        }

        let elapsed_ms = self.start_time.elapsed().as_secs_f64() * 1000.0;
        let mut lines = vec![format!(
            "Encode summary ({} submitted, {} emitted, {:.1}s total):",
            self.submitted,
            self.emitted,
            elapsed_ms / 1000.0
        )];

        let mut names: Vec<_> = self.stages.keys().collect();
        names.sort();
        for name in names {
            let stage = &self.stages[name];
            let avg_ms = if stage.count == 0 {
                0.0
            } else {
                stage.total_ms / stage.count as f64
            };
            lines.push(format!(
                "  {name:8}: avg {avg_ms:6.2}ms  total {:7.0}ms",
                stage.total_ms
            ));
        }

        if self.submitted > 0 && elapsed_ms > 0.0 {
            let fps = self.submitted as f64 / (elapsed_ms / 1000.0);
            lines.push(format!("  Throughput: {fps:.1} fps"));
        }

        Some(lines.join("\n"))
    }

    pub fn average_ms(&self, stage: &str) -> Option<f64> {
        self.stages
            .get(stage)
            .filter(|s| s.count > 0)
            .map(|s| s.total_ms / s.count as f64)
    }
}

impl Default for StdoutEncodeLogger {
    fn default() -> Self {
        Self::new(60)
    }
}

impl EncodeLogger for StdoutEncodeLogger {
    fn progress(&mut self, submitted: u64, emitted: u64) {
        self.submitted = submitted;
        self.emitted = emitted;
        if submitted > 0
            && submitted % self.throttle_frames == 0
            && self.last_reported != Some(submitted)
        {
            self.last_reported = Some(submitted);
            log::info!("Encoded {emitted}/{submitted} frames");
        }
    }

    fn timing(&mut self, stage: &str, duration_ms: f64) {
        let totals = self.stages.entry(stage.to_string()).or_default();
        totals.count += 1;
        totals.total_ms += duration_ms;
    }

    fn info(&mut self, message: &str) {
        log::info!("{message}");
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n\n{text}");
        }
    }
}
