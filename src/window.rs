//! Window calculation.
//!
//! A window is anchored to a local wall-clock time (e.g. 13:00 in
//! `Europe/Riga`) and spans one local day. Boundaries are resolved in the
//! configured timezone first and converted to UTC afterwards, so the anchor
//! stays at the same local time across daylight-saving transitions even
//! though the absolute length of such a window is 23 or 25 hours.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{PipelineError, Result};
use crate::models::Window;

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| PipelineError::Config(format!("unknown timezone: '{name}'")))
}

fn anchor_time(hour: u32, minute: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
        PipelineError::Config(format!(
            "anchor time {hour:02}:{minute:02} is out of range (hour 0..23, minute 0..59)"
        ))
    })
}

/// Longest span a clock change can skip. Real transitions skip an hour, a
/// few reach a whole day.
const MAX_GAP_MINUTES: i64 = 2 * 24 * 60;

/// Resolve a local wall-clock time to an instant.
///
/// Ambiguous times (clocks going back) take the earlier instant. Times that
/// do not exist (clocks going forward) move to the first valid instant after
/// the gap.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Result<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            // Transitions fall on whole minutes, so the first minute that
            // exists again is where the gap ends.
            let start = naive.with_second(0).and_then(|n| n.with_nanosecond(0)).unwrap_or(naive);
            (1..=MAX_GAP_MINUTES)
                .map(|m| start + Duration::minutes(m))
                .find_map(|probe| tz.from_local_datetime(&probe).earliest())
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| PipelineError::Config(format!("local time {naive} does not exist in {}", tz.name())))
        }
    }
}

fn window_ending_on(end_date: NaiveDate, anchor: NaiveTime, tz: Tz) -> Result<Window> {
    let start_date = end_date - Duration::days(1);
    let start = resolve_local(tz, start_date.and_time(anchor))?;
    let end = resolve_local(tz, end_date.and_time(anchor))?;
    Ok(Window {
        id: Window::id_for(start, end),
        start,
        end,
        timezone: tz.name().to_string(),
    })
}

/// Compute the window containing `reference`.
///
/// If the local time of `reference` is before the anchor, the window is
/// `[yesterday's anchor, today's anchor)`; otherwise it is
/// `[today's anchor, tomorrow's anchor)`.
pub fn compute(reference: DateTime<Utc>, anchor_hour: u32, anchor_minute: u32, tz: Tz) -> Result<Window> {
    let anchor = anchor_time(anchor_hour, anchor_minute)?;
    let local = reference.with_timezone(&tz);
    let today = local.date_naive();

    let end_date = if local.time() < anchor {
        today
    } else {
        today + Duration::days(1)
    };

    let window = window_ending_on(end_date, anchor, tz)?;
    // Inside a fall-back repeat the local clock can read "before anchor"
    // while the instant is already past the first occurrence.
    if reference >= window.end {
        return window_ending_on(end_date + Duration::days(1), anchor, tz);
    }
    // An anchor inside a spring-forward gap starts the window late; the
    // minutes before it still belong to the previous day.
    if reference < window.start {
        return window_ending_on(end_date - Duration::days(1), anchor, tz);
    }
    Ok(window)
}

/// The window that closes at the anchor on `date` (local calendar date).
pub fn for_closing_date(date: NaiveDate, anchor_hour: u32, anchor_minute: u32, tz: Tz) -> Result<Window> {
    let anchor = anchor_time(anchor_hour, anchor_minute)?;
    window_ending_on(date, anchor, tz)
}

/// Next instant strictly after `now` whose local time is `hour:minute`.
pub fn next_occurrence(now: DateTime<Utc>, hour: u32, minute: u32, tz: Tz) -> Result<DateTime<Utc>> {
    let at = anchor_time(hour, minute)?;
    let today = now.with_timezone(&tz).date_naive();
    let mut date = today;
    loop {
        let candidate = resolve_local(tz, date.and_time(at))?;
        if candidate > now {
            return Ok(candidate);
        }
        date += Duration::days(1);
    }
}
