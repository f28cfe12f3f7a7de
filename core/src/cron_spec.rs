use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use chrono::DateTime;
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;

/// A parsed cron schedule, evaluated in UTC.
///
/// Accepts the 5-field form (`m h dom mon dow`) and the 6-field form with a
/// leading seconds column, selected by field count; any other count is
/// rejected. The underlying grammar always carries seconds, so the 5-field
/// form gets a literal `0` prepended.
#[derive(Debug, Clone)]
pub struct CronSpec {
    source: String,
    schedule: Schedule,
}

impl CronSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 => trimmed.to_string(),
            n => bail!("cron expression must have 5 or 6 fields, got {n}: {text:?}"),
        };
        let schedule = Schedule::from_str(&normalized)
            .with_context(|| format!("invalid cron expression: {text:?}"))?;
        Ok(Self {
            source: trimmed.to_string(),
            schedule,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The next occurrence strictly after `after`. Missed occurrences are
    /// never back-filled: an offline span produces exactly one run at the
    /// next pass and this advances past it.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn five_field_form_fires_on_minutes() {
        let spec = CronSpec::parse("*/5 * * * *").expect("parse 5-field");
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 3, 0).single().expect("ts");
        let next = spec.next_after(at).expect("next occurrence");
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).single().expect("ts"));
    }

    #[test]
    fn six_field_form_carries_seconds() {
        let spec = CronSpec::parse("30 */5 * * * *").expect("parse 6-field");
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 3, 0).single().expect("ts");
        let next = spec.next_after(at).expect("next occurrence");
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 30).single().expect("ts")
        );
    }

    #[test]
    fn occurrences_are_strictly_after_the_reference() {
        let spec = CronSpec::parse("*/5 * * * *").expect("parse");
        let on_the_mark = Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).single().expect("ts");
        let next = spec.next_after(on_the_mark).expect("next occurrence");
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 10, 0).single().expect("ts")
        );
    }

    #[test]
    fn other_field_counts_are_rejected() {
        for text in ["* * * *", "* * * * * * *", "", "every day"] {
            assert!(CronSpec::parse(text).is_err(), "accepted {text:?}");
        }
    }
}
