use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Timelike, Utc};
use std::collections::BTreeSet;

/// India Standard Time, UTC+05:30.
const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

// NSE/BSE close at 15:30 IST; snapshots are only complete a little later.
const CLOSE_CUTOFF: (u32, u32) = (16, 0);

/// Market date a snapshot should be filed under. An explicit `YYYY-MM-DD`
/// wins; otherwise today's exchange-local date (yesterday before the close
/// cutoff), rolled back over weekends and holidays.
pub fn resolve_as_of_date(
    as_of_date_arg: Option<&str>,
    now_utc: DateTime<Utc>,
) -> anyhow::Result<NaiveDate> {
    if let Some(s) = as_of_date_arg {
        return NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid as-of date {s:?} (expected YYYY-MM-DD)"));
    }

    let ist = FixedOffset::east_opt(IST_OFFSET_SECS).context("invalid IST offset")?;
    let now_ist = now_utc.with_timezone(&ist);

    let mut date = now_ist.date_naive();
    if (now_ist.hour(), now_ist.minute()) < CLOSE_CUTOFF {
        date -= Duration::days(1);
    }

    let holidays = configured_holidays(std::env::var("MARKET_HOLIDAYS").ok().as_deref());
    Ok(previous_trading_day(date, &holidays))
}

/// `date` itself if it is a trading day, otherwise the closest one before it.
pub fn previous_trading_day(mut date: NaiveDate, holidays: &BTreeSet<NaiveDate>) -> NaiveDate {
    while is_weekend(date) || holidays.contains(&date) {
        date -= Duration::days(1);
    }
    date
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun)
}

/// Fixed-date national holidays (Republic Day, Independence Day, Gandhi
/// Jayanti, Christmas) plus any `YYYY-MM-DD` dates listed in `extra`,
/// comma-separated. Unparseable entries are skipped.
pub fn configured_holidays(extra: Option<&str>) -> BTreeSet<NaiveDate> {
    let mut out = BTreeSet::new();
    for y in 2024..=2030 {
        for (m, d) in [(1, 26), (8, 15), (10, 2), (12, 25)] {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                out.insert(date);
            }
        }
    }

    for part in extra.unwrap_or_default().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match NaiveDate::parse_from_str(part, "%Y-%m-%d") {
            Ok(d) => {
                out.insert(d);
            }
            Err(_) => tracing::warn!(entry = part, "ignoring malformed MARKET_HOLIDAYS entry"),
        }
    }

    out
}
