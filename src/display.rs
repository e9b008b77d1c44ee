use chrono::{DateTime, Utc};

use crate::models::{parse_timestamp, UsageSnapshot, UsageWindow};
use crate::poller::PollError;

pub const WARNING_THRESHOLD: f64 = 80.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
    Error,
}

/// Compact status derived from the last poll outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusBadge {
    pub text: String,
    pub severity: Severity,
}

impl StatusBadge {
    pub fn from_result(result: &Result<UsageSnapshot, PollError>) -> Self {
        match result {
            Ok(snapshot) => {
                let pct = snapshot.five_hour.utilization.round();
                Self {
                    text: format!("{pct:.0}"),
                    severity: if pct >= WARNING_THRESHOLD {
                        Severity::Warning
                    } else {
                        Severity::Normal
                    },
                }
            }
            Err(_) => Self {
                text: "!".to_string(),
                severity: Severity::Error,
            },
        }
    }
}

/// Format a usage window as "X% · Yh" style text
pub fn format_line(window: &UsageWindow, now: DateTime<Utc>) -> String {
    let pct = format!("{:.0}%", window.utilization);
    let cd = format_countdown(parse_timestamp(&window.resets_at), now);
    if cd.is_empty() {
        pct
    } else {
        format!("{pct} \u{00b7} {cd}")
    }
}

pub fn status_line(snapshot: &UsageSnapshot, now: DateTime<Utc>) -> String {
    let five_hour = format!("5h {}", format_line(&snapshot.five_hour, now));
    match &snapshot.seven_day {
        Some(seven_day) => format!("{five_hour}  7d {}", format_line(seven_day, now)),
        None => five_hour,
    }
}

fn format_countdown(resets_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let reset = match resets_at {
        Some(t) => t,
        None => return String::new(),
    };

    let total_secs = (reset - now).num_seconds();
    if total_secs <= 0 {
        return "now".to_string();
    }

    let total_mins = total_secs / 60;
    let total_hours = total_secs / 3600;
    let total_days = total_secs / 86400;

    if total_days >= 1 {
        format!("{total_days}d")
    } else if total_mins > 61 {
        format!("{total_hours}h")
    } else {
        format!("{total_mins}m")
    }
}
