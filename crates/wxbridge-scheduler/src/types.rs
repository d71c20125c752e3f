use serde::{Deserialize, Serialize};

/// One scheduled command, fired at most once per calendar day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    /// `HH:MM`, 24-hour, zero-padded.
    pub time_hm: String,
    pub command: String,
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    /// `YYYY-MM-DD` of the last automatic run; gates the once-per-day rule.
    #[serde(default)]
    pub last_run_date: Option<String>,
    pub created_at: String,
}

/// Strict `[00-23]:[00-59]` check.
pub fn valid_time_hm(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return false;
    }
    let (hh, mm) = (&value[..2], &value[3..]);
    match (hh.parse::<u8>(), mm.parse::<u8>()) {
        (Ok(h), Ok(m)) => h < 24 && m < 60 && hh.chars().all(|c| c.is_ascii_digit()) && mm.chars().all(|c| c.is_ascii_digit()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_times_pass() {
        for t in ["00:00", "09:05", "23:59", "12:30"] {
            assert!(valid_time_hm(t), "{t}");
        }
    }

    #[test]
    fn malformed_times_fail() {
        for t in ["24:00", "12:60", "9:05", "12:5", "1230", "ab:cd", "12:30:00", "-1:00", "+2:30"] {
            assert!(!valid_time_hm(t), "{t}");
        }
    }
}
