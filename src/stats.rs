//! Per-session statistics
//!
//! Decoder and encoder sessions populate the same structure so both
//! directions log alike.

use std::time::{Duration, Instant};

/// Statistics of one decoder or encoder session
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Engine backend identifier
    pub backend: &'static str,

    /// Input units pushed to the engine
    pub frames_in: u64,

    /// Output units handed to the caller
    pub frames_out: u64,

    /// Frames the engine reported as skipped
    pub frames_skipped: u64,

    /// Keyframes produced (encode)
    pub keyframes: u64,

    /// Bytes of encoded output (encode)
    pub bytes_encoded: u64,

    /// Stream negotiations handled (decode)
    pub renegotiations: u64,

    /// Pool growth events
    pub pool_grows: u64,

    /// Framebuffers added to the pool in total
    pub framebuffers_added: u64,

    /// Engine steps run by the dispatcher
    pub steps: u64,

    /// Average engine step time in milliseconds
    pub avg_step_time_ms: f32,

    /// Maximum engine step time observed (ms)
    pub max_step_time_ms: f32,

    /// Timestamp when the session was opened
    pub created_at: Instant,
}

impl SessionStats {
    /// Create new stats for a backend
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            frames_in: 0,
            frames_out: 0,
            frames_skipped: 0,
            keyframes: 0,
            bytes_encoded: 0,
            renegotiations: 0,
            pool_grows: 0,
            framebuffers_added: 0,
            steps: 0,
            avg_step_time_ms: 0.0,
            max_step_time_ms: 0.0,
            created_at: Instant::now(),
        }
    }

    /// Record one engine step
    pub fn record_step(&mut self, step_time_ms: f32) {
        self.steps += 1;

        if self.steps == 1 {
            self.avg_step_time_ms = step_time_ms;
        } else {
            // Exponential moving average (α = 0.1)
            self.avg_step_time_ms = self.avg_step_time_ms * 0.9 + step_time_ms * 0.1;
        }
        self.max_step_time_ms = self.max_step_time_ms.max(step_time_ms);
    }

    pub fn record_input(&mut self) {
        self.frames_in += 1;
    }

    /// Record an output unit handed to the caller
    pub fn record_output(&mut self, bytes: usize, is_keyframe: bool) {
        self.frames_out += 1;
        self.bytes_encoded += bytes as u64;
        if is_keyframe {
            self.keyframes += 1;
        }
    }

    pub fn record_skip(&mut self) {
        self.frames_skipped += 1;
    }

    pub fn record_renegotiation(&mut self) {
        self.renegotiations += 1;
    }

    /// Record framebuffers added to the pool
    pub fn record_pool_growth(&mut self, count: usize) {
        self.pool_grows += 1;
        self.framebuffers_added += count as u64;
    }

    /// Time since the session was opened
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Output frames per second since open
    pub fn fps(&self) -> f32 {
        let elapsed_secs = self.uptime().as_secs_f32();
        if elapsed_secs > 0.0 {
            self.frames_out as f32 / elapsed_secs
        } else {
            0.0
        }
    }

    /// Format stats for logging
    pub fn summary(&self) -> String {
        format!(
            "{}: {} in, {} out, {} skipped, {} negotiation(s), {} framebuffer(s) added, {} bytes, avg {:.3}ms/step",
            self.backend,
            self.frames_in,
            self.frames_out,
            self.frames_skipped,
            self.renegotiations,
            self.framebuffers_added,
            self.bytes_encoded,
            self.avg_step_time_ms
        )
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new("unknown")
    }
}

/// Timing helper for measuring engine steps
pub struct StepTimer {
    start: Instant,
}

impl StepTimer {
    /// Start timing an engine step
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> f32 {
        self.start.elapsed().as_secs_f32() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = SessionStats::new("loopback");
        assert_eq!(stats.backend, "loopback");
        assert_eq!(stats.frames_out, 0);
        assert_eq!(stats.steps, 0);
    }

    #[test]
    fn test_stats_record_step() {
        let mut stats = SessionStats::new("loopback");
        stats.record_step(2.0);
        assert!((stats.avg_step_time_ms - 2.0).abs() < 0.01);

        stats.record_step(4.0);
        assert_eq!(stats.steps, 2);
        assert!((stats.avg_step_time_ms - 2.2).abs() < 0.01);
        assert!((stats.max_step_time_ms - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_stats_record_output() {
        let mut stats = SessionStats::new("loopback");
        stats.record_output(1000, true);
        stats.record_output(500, false);
        assert_eq!(stats.frames_out, 2);
        assert_eq!(stats.keyframes, 1);
        assert_eq!(stats.bytes_encoded, 1500);
    }

    #[test]
    fn test_stats_pool_growth() {
        let mut stats = SessionStats::new("loopback");
        stats.record_pool_growth(3);
        stats.record_pool_growth(1);
        assert_eq!(stats.pool_grows, 2);
        assert_eq!(stats.framebuffers_added, 4);
    }

    #[test]
    fn test_stats_summary() {
        let mut stats = SessionStats::new("scripted");
        stats.record_skip();
        let summary = stats.summary();
        assert!(summary.contains("scripted"));
        assert!(summary.contains("1 skipped"));
    }

    #[test]
    fn test_step_timer() {
        let timer = StepTimer::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 9.0);
    }
}
