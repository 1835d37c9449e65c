use serde::Serialize;
use std::io::Write;
use trigger_rs::ArrayReport;

/// Where a command's JSON goes
#[derive(Debug, Clone, Copy)]
pub enum Destination<'a> {
    Stdout,
    File(&'a str),
}

impl<'a> Destination<'a> {
    pub fn from_arg(path: Option<&'a str>) -> Self {
        path.map_or(Destination::Stdout, Destination::File)
    }
}

fn render<T: Serialize>(value: &T, compact: bool) -> Result<String, String> {
    let rendered = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    rendered.map_err(|e| format!("JSON serialization failed: {}", e))
}

fn deliver(json: &str, destination: Destination<'_>) -> Result<(), String> {
    match destination {
        Destination::File(path) => {
            std::fs::write(path, format!("{}\n", json))
                .map_err(|e| format!("Failed to write report '{}': {}", path, e))
        }
        Destination::Stdout => {
            let mut handle = std::io::stdout().lock();
            writeln!(handle, "{}", json).map_err(|e| format!("Failed to write to stdout: {}", e))
        }
    }
}

/// Serialize `value` and write it out. Failures are printed; returns false on any.
pub fn emit<T: Serialize>(value: &T, compact: bool, destination: Destination<'_>) -> bool {
    match render(value, compact).and_then(|json| deliver(&json, destination)) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Error: {}", e);
            false
        }
    }
}

/// One-line run summary for stderr.
pub fn summarize(report: &ArrayReport) -> String {
    let rounds = report.coordinator.as_ref().map_or(0, |c| c.rounds);
    let candidates: u64 = report
        .workers
        .iter()
        .filter_map(|w| w.summary.as_ref())
        .map(|s| s.candidates)
        .sum();
    let failed = report.workers.iter().filter(|w| w.error.is_some()).count()
        + usize::from(report.coordinator_error.is_some());
    let elapsed = (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0;

    format!(
        "Session {}: {} round(s) in {:.1}s, {} of {} candidate(s) saved across {} antenna(s){}",
        report.session_id,
        rounds,
        elapsed,
        report.saved_events(),
        candidates,
        report.workers.len(),
        if failed > 0 {
            format!(", {} node(s) failed", failed)
        } else {
            String::new()
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_render_compact_and_pretty() {
        let value = serde_json::json!({ "a": 1 });
        assert_eq!(render(&value, true).unwrap(), r#"{"a":1}"#);
        assert!(render(&value, false).unwrap().contains('\n'));
    }

    #[test]
    fn test_summary_of_empty_report() {
        let now = Utc::now();
        let report = ArrayReport {
            session_id: "s".into(),
            started_at: now,
            finished_at: now,
            coordinator: None,
            coordinator_error: Some("lost".into()),
            workers: Vec::new(),
        };
        let line = summarize(&report);
        assert!(line.starts_with("Session s: 0 round(s)"));
        assert!(line.ends_with("1 node(s) failed"));
    }
}
