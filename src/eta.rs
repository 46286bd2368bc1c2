// src/eta.rs

//! Per-subject completion estimate for long batches.
//!
//! The tracker is fed the wall-clock time at each subject start. The gap
//! between two consecutive starts is one subject's duration; the estimate is
//! the batch start plus the mean (or median) duration times the batch size.

use chrono::{DateTime, Duration, Local};

use crate::types::EtaMode;

#[derive(Debug, Clone)]
pub struct EtaTracker {
    mode: EtaMode,
    total: usize,
    started: Option<DateTime<Local>>,
    last: Option<DateTime<Local>>,
    durations: Vec<Duration>,
}

impl EtaTracker {
    pub fn new(mode: EtaMode, total: usize) -> Self {
        Self {
            mode,
            total,
            started: None,
            last: None,
            durations: Vec::new(),
        }
    }

    /// Record a subject start at `now` and return the message to log.
    pub fn update(&mut self, now: DateTime<Local>) -> String {
        let Some(started) = self.started else {
            self.started = Some(now);
            self.last = Some(now);
            return format!("Starting time: {}", now.format("%H:%M:%S"));
        };

        if let Some(last) = self.last.replace(now) {
            self.durations.push(now - last);
        }

        let secs: Vec<f64> = self.durations.iter().map(seconds).collect();
        let mean = mean(&secs);
        let median = median(&secs);
        let sd = stdev(&secs);
        let per_subject = match self.mode {
            EtaMode::Mean => mean,
            EtaMode::Median => median,
        };
        let eta = started + Duration::milliseconds((per_subject * self.total as f64 * 1000.0) as i64);
        let last = secs.last().copied().unwrap_or_default();

        format!(
            "ETA: {} | TIMINGS (min): last N = {:.2}, M = {:.2}, SD = {:.2}, MED = {:.2}",
            eta.format("%H:%M:%S on %d.%m.%Y"),
            last / 60.0,
            mean / 60.0,
            sd / 60.0,
            median / 60.0,
        )
    }

    /// Number of completed subject durations seen so far.
    pub fn samples(&self) -> usize {
        self.durations.len()
    }
}

fn seconds(d: &Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn median(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Sample standard deviation; zero until there are more than two samples.
fn stdev(xs: &[f64]) -> f64 {
    if xs.len() <= 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn first_update_reports_start() {
        let mut eta = EtaTracker::new(EtaMode::Median, 10);
        assert_eq!(eta.update(at(9, 0)), "Starting time: 09:00:00");
        assert_eq!(eta.samples(), 0);
    }

    #[test]
    fn median_ignores_one_slow_subject() {
        let mut eta = EtaTracker::new(EtaMode::Median, 4);
        eta.update(at(9, 0));
        eta.update(at(9, 10));
        eta.update(at(9, 20));
        let msg = eta.update(at(10, 20));
        // durations 10, 10, 60 min; median 10 min x 4 subjects
        assert!(msg.starts_with("ETA: 09:40:00 on 01.03.2024"), "{msg}");
        assert!(msg.contains("last N = 60.00"), "{msg}");
        assert!(msg.contains("MED = 10.00"), "{msg}");
    }

    #[test]
    fn mean_mode_uses_average() {
        let mut eta = EtaTracker::new(EtaMode::Mean, 2);
        eta.update(at(9, 0));
        eta.update(at(9, 10));
        let msg = eta.update(at(9, 40));
        // durations 10 and 30 min; mean 20 min x 2 subjects
        assert!(msg.starts_with("ETA: 09:40:00"), "{msg}");
        assert!(msg.contains("SD = 0.00"), "{msg}");
    }

    #[test]
    fn statistics_helpers() {
        assert_eq!(median(&[3.0, 1.0, 2.0, 10.0]), 2.5);
        assert_eq!(mean(&[]), 0.0);
        assert!((stdev(&[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-12);
    }
}
