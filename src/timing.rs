use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Timing scope that logs its lifetime when dropped
pub struct ProfileScope {
    label: String,
    start: Instant,
}

impl ProfileScope {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        log::debug!(
            "[PROFILE] {} - {:.3}ms",
            self.label,
            self.start.elapsed().as_secs_f64() * 1000.0
        );
    }
}

#[macro_export]
macro_rules! profile_scope {
    ($label:expr) => {
        let _profile_scope = $crate::timing::ProfileScope::new($label);
    };
}

/// Stages of a worker round, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Barrier exit to captured buffer
    Sync,
    Detect,
    /// Candidates out, decision back
    Exchange,
    Commit,
}

impl Stage {
    fn index(self) -> usize {
        match self {
            Stage::Sync => 0,
            Stage::Detect => 1,
            Stage::Exchange => 2,
            Stage::Commit => 3,
        }
    }
}

/// Per-round stage clock behind the `log.txt` statistics line
#[derive(Debug, Clone)]
pub struct RoundClock {
    wall_start: DateTime<Utc>,
    last: Instant,
    stages: [Duration; 4],
}

impl RoundClock {
    pub fn start() -> Self {
        Self {
            wall_start: Utc::now(),
            last: Instant::now(),
            stages: [Duration::ZERO; 4],
        }
    }

    pub fn wall_start(&self) -> DateTime<Utc> {
        self.wall_start
    }

    /// Close `stage` at the current instant.
    pub fn mark(&mut self, stage: Stage) {
        let now = Instant::now();
        self.stages[stage.index()] += now - self.last;
        self.last = now;
    }

    pub fn elapsed(&self, stage: Stage) -> Duration {
        self.stages[stage.index()]
    }
}

/// Everything that goes into one round's statistics line
#[derive(Debug, Clone)]
pub struct RoundLogLine<'a> {
    pub clock: &'a RoundClock,
    pub round: u64,
    pub epoch_start: Option<u64>,
    pub epoch_stop: Option<u64>,
    pub candidates: usize,
    pub saved: usize,
    pub noise: f32,
}

impl std::fmt::Display for RoundLogLine<'_> {
    /// `t0 dt_sync dt_detect dt_exchange dt_commit round epoch_start epoch_stop n_candidates n_saved noise`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t0 = self.clock.wall_start.timestamp_micros() as f64 * 1.0e-6;
        let epoch = |e: Option<u64>| e.map(|e| e as i64).unwrap_or(-1);
        write!(
            f,
            "{:.3} {:.3} {:.3} {:.3} {:.3} {} {} {} {} {} {:.1}",
            t0,
            self.clock.elapsed(Stage::Sync).as_secs_f64(),
            self.clock.elapsed(Stage::Detect).as_secs_f64(),
            self.clock.elapsed(Stage::Exchange).as_secs_f64(),
            self.clock.elapsed(Stage::Commit).as_secs_f64(),
            self.round,
            epoch(self.epoch_start),
            epoch(self.epoch_stop),
            self.candidates,
            self.saved,
            self.noise
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_accumulate() {
        let mut clock = RoundClock::start();
        std::thread::sleep(Duration::from_millis(5));
        clock.mark(Stage::Sync);
        clock.mark(Stage::Detect);
        assert!(clock.elapsed(Stage::Sync) >= Duration::from_millis(5));
        assert!(clock.elapsed(Stage::Detect) < clock.elapsed(Stage::Sync));
        assert_eq!(clock.elapsed(Stage::Commit), Duration::ZERO);
    }

    #[test]
    fn test_log_line_fields() {
        let clock = RoundClock::start();
        let line = RoundLogLine {
            clock: &clock,
            round: 3,
            epoch_start: Some(10),
            epoch_stop: None,
            candidates: 4,
            saved: 2,
            noise: 12.34,
        }
        .to_string();

        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields.len(), 11);
        assert_eq!(&fields[5..], &["3", "10", "-1", "4", "2", "12.3"]);
    }

    #[test]
    fn test_profile_scope_drops() {
        profile_scope!("unit");
    }
}
