use anyhow::Result;
use async_trait::async_trait;
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Timelike, Utc, Weekday,
};
use serde_json::json;

use super::{SupportTool, ToolKind, ToolOutput};

/// Support desk hours, Pacific time, Monday to Friday.
const OPEN_HOUR: u32 = 6;
const CLOSE_HOUR: u32 = 18;

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    first.checked_add_signed(Duration::days((offset + 7 * (n - 1)) as i64))
}

/// US Pacific offset: DST from 2:00 local on the second Sunday of March to
/// 2:00 local on the first Sunday of November.
fn pacific_offset(now: DateTime<Utc>) -> FixedOffset {
    let year = now.year();
    let dst_window = nth_weekday(year, 3, Weekday::Sun, 2)
        .zip(nth_weekday(year, 11, Weekday::Sun, 1))
        .and_then(|(start, end)| {
            let start = Utc.from_utc_datetime(&start.and_hms_opt(10, 0, 0)?);
            let end = Utc.from_utc_datetime(&end.and_hms_opt(9, 0, 0)?);
            Some((start, end))
        });
    let hours = match dst_window {
        Some((start, end)) if now >= start && now < end => -7,
        _ => -8,
    };
    FixedOffset::west_opt(-hours * 3600).unwrap_or_else(|| Utc.fix())
}

fn is_business_hours(local: &DateTime<FixedOffset>) -> bool {
    let weekday = local.weekday();
    !matches!(weekday, Weekday::Sat | Weekday::Sun) && (OPEN_HOUR..CLOSE_HOUR).contains(&local.hour())
}

fn describe(now: DateTime<Utc>, query: &str) -> ToolOutput {
    let lower = query.to_lowercase();
    let pacific = now.with_timezone(&pacific_offset(now));
    let tz_label = if pacific.offset().local_minus_utc() == -7 * 3600 { "PDT" } else { "PST" };
    let open = is_business_hours(&pacific);

    let mut lines = vec![format!(
        "It is currently {} UTC ({} {}).",
        now.format("%A, %B %-d %Y %H:%M"),
        pacific.format("%H:%M"),
        tz_label
    )];
    lines.push(if open {
        format!("Support is open now (weekdays {}:00-{}:00 Pacific).", OPEN_HOUR, CLOSE_HOUR)
    } else {
        format!("Support is closed now. Hours are weekdays {}:00-{}:00 Pacific.", OPEN_HOUR, CLOSE_HOUR)
    });

    let today = pacific.date_naive();
    for (word, delta) in [("yesterday", -1i64), ("tomorrow", 1)] {
        if lower.contains(word) {
            if let Some(day) = today.checked_add_signed(Duration::days(delta)) {
                lines.push(format!("{} is {}.", capitalize(word), day.format("%A, %B %-d")));
            }
        }
    }
    if lower.contains("weekend") {
        let weekend = matches!(today.weekday(), Weekday::Sat | Weekday::Sun);
        if weekend {
            lines.push("It is the weekend in Pacific time.".into());
        } else {
            let days = 5 - today.weekday().num_days_from_monday() as i64;
            if let Some(saturday) = today.checked_add_signed(Duration::days(days)) {
                lines.push(format!("The weekend starts {}.", saturday.format("%A, %B %-d")));
            }
        }
    }

    let data = json!({
        "utc": now.to_rfc3339(),
        "pacific": pacific.to_rfc3339(),
        "businessHours": open,
        "weekday": today.weekday().to_string(),
    });
    ToolOutput::success(0.95, lines.join(" "), data)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub struct DateTimeTool;

impl DateTimeTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DateTimeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SupportTool for DateTimeTool {
    fn name(&self) -> &str {
        ToolKind::Datetime.id()
    }

    fn description(&self) -> &str {
        ToolKind::Datetime.description()
    }

    fn should_use(&self, query: &str) -> bool {
        ToolKind::Datetime.matches(query)
    }

    async fn execute(&self, query: &str) -> Result<ToolOutput> {
        Ok(describe(Utc::now(), query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_pacific_offset_tracks_dst() {
        assert_eq!(pacific_offset(utc(2025, 1, 15, 12)).local_minus_utc(), -8 * 3600);
        assert_eq!(pacific_offset(utc(2025, 7, 1, 12)).local_minus_utc(), -7 * 3600);
        // 2025-03-09 is the second Sunday of March
        assert_eq!(pacific_offset(utc(2025, 3, 9, 9)).local_minus_utc(), -8 * 3600);
        assert_eq!(pacific_offset(utc(2025, 3, 9, 11)).local_minus_utc(), -7 * 3600);
    }

    #[test]
    fn test_business_hours() {
        // Wednesday 2025-01-15 20:00 UTC is 12:00 PST
        let out = describe(utc(2025, 1, 15, 20), "are you open now?");
        assert_eq!(out.data["businessHours"], true);
        // Saturday
        let out = describe(utc(2025, 1, 18, 20), "are you open now?");
        assert_eq!(out.data["businessHours"], false);
    }

    #[test]
    fn test_relative_days() {
        let out = describe(utc(2025, 1, 15, 20), "what date is tomorrow and when is the weekend");
        assert!(out.message.contains("Tomorrow is Thursday, January 16"), "{}", out.message);
        assert!(out.message.contains("The weekend starts Saturday, January 18"), "{}", out.message);
    }
}
