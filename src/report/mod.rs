//! Sales reports sent to the operator: storefront totals, the ticketing vendor's daily sales
//! and the final reconciliation of sent confirmations.

pub mod interpark;
pub mod reconcile;
pub mod store;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike, Utc, Weekday};

pub const DIVIDER: &str = "━━━━━━━━━━━━━━━━";

/// The business runs on Korean time regardless of where the bot is hosted.
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap()
}

pub fn kst_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

pub fn weekday_ko(date: NaiveDate) -> &'static str {
    match date.weekday() {
        Weekday::Mon => "월",
        Weekday::Tue => "화",
        Weekday::Wed => "수",
        Weekday::Thu => "목",
        Weekday::Fri => "금",
        Weekday::Sat => "토",
        Weekday::Sun => "일",
    }
}

/// `3/15(일)`
pub fn date_label(date: NaiveDate) -> String {
    format!("{}/{}({})", date.month(), date.day(), weekday_ko(date))
}

/// `14시 05분`
pub fn time_label(now: &DateTime<FixedOffset>) -> String {
    format!("{}시 {:02}분", now.hour(), now.minute())
}

/// `1234567` → `1,234,567`
pub fn format_won(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if amount < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn korean_labels() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        assert_eq!(weekday_ko(date), "일");
        assert_eq!(date_label(date), "3/15(일)");

        let now = kst()
            .with_ymd_and_hms(2026, 3, 15, 9, 5, 0)
            .single()
            .unwrap();
        assert_eq!(time_label(&now), "9시 05분");
    }

    #[test]
    fn won_grouping() {
        assert_eq!(format_won(0), "0");
        assert_eq!(format_won(999), "999");
        assert_eq!(format_won(1000), "1,000");
        assert_eq!(format_won(1234567), "1,234,567");
        assert_eq!(format_won(-55000), "-55,000");
    }

    #[test]
    fn kst_is_nine_hours_ahead() {
        let utc = Utc.with_ymd_and_hms(2026, 3, 14, 20, 0, 0).unwrap();
        let local = utc.with_timezone(&kst());
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2026, 3, 15).unwrap());
    }
}
