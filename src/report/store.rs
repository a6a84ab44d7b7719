//! Storefront sales by performance: today, yesterday and everything in the search window.

use chrono::{DateTime, Days, FixedOffset, NaiveDate};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::OnceLock;

use super::{date_label, time_label, DIVIDER};
use crate::config::Performance;
use crate::model::seat_of;
use crate::scrape::SalesRow;

const UNKNOWN_REGION: &str = "기타";
const UNKNOWN_SEAT: &str = "미분류";

fn region_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[([^\]]+)\]").unwrap())
}

/// Seat counts for one performance. Seats are keyed by grade, e.g. `S석`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerformanceSales {
    pub key: String,
    pub name: String,
    pub date: String,
    pub today: BTreeMap<String, u32>,
    pub yesterday: BTreeMap<String, u32>,
    pub total: BTreeMap<String, u32>,
}

/// `<region>_<디즈니|지브리>` plus the seat grade of a product line.
pub fn performance_key(product: &str) -> (String, String) {
    let region = region_re()
        .captures(product)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| UNKNOWN_REGION.to_string());
    let kind = if product.contains("디즈니") { "디즈니" } else { "지브리" };
    let seat = seat_of(product).unwrap_or_else(|| UNKNOWN_SEAT.to_string());
    (format!("{region}_{kind}"), seat)
}

/// Cancelled rows are left out entirely. Sorted by performance date label.
pub fn summarize(
    rows: &[SalesRow],
    performances: &BTreeMap<String, Performance>,
    today: NaiveDate,
) -> Vec<PerformanceSales> {
    let yesterday = today.checked_sub_days(Days::new(1));
    let mut by_key: BTreeMap<String, PerformanceSales> = BTreeMap::new();

    for row in rows.iter().filter(|r| !r.is_cancelled()) {
        let (key, seat) = performance_key(&row.product);
        let entry = by_key.entry(key.clone()).or_insert_with(|| {
            let (name, date) = match performances.get(&key) {
                Some(p) => (p.name.clone(), p.date.clone()),
                None => (key.split('_').next().unwrap_or(&key).to_string(), String::new()),
            };
            PerformanceSales {
                key,
                name,
                date,
                ..PerformanceSales::default()
            }
        });

        *entry.total.entry(seat.clone()).or_default() += row.quantity;
        if row.date == today {
            *entry.today.entry(seat).or_default() += row.quantity;
        } else if Some(row.date) == yesterday {
            *entry.yesterday.entry(seat).or_default() += row.quantity;
        }
    }

    let mut summary: Vec<PerformanceSales> = by_key.into_values().collect();
    summary.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.key.cmp(&b.key)));
    summary
}

fn seat_list(seats: &BTreeMap<String, u32>) -> String {
    seats
        .iter()
        .map(|(seat, count)| format!("{seat} {count}매"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn format_store_report(
    summary: &[PerformanceSales],
    today: NaiveDate,
    now: &DateTime<FixedOffset>,
) -> String {
    let today_label = date_label(today);
    let mut msg = format!(
        "📦 <b>네이버 스토어 판매현황</b>\n📅 {} {} 조회\n{DIVIDER}\n",
        today_label,
        time_label(now)
    );
    if summary.is_empty() {
        msg.push_str("\n주문 없음");
        return msg;
    }

    let yesterday_label = today
        .checked_sub_days(Days::new(1))
        .map(date_label)
        .unwrap_or_default();
    let periods: [(&str, &str, fn(&PerformanceSales) -> &BTreeMap<String, u32>); 2] = [
        ("오늘", &today_label, |p| &p.today),
        ("어제", &yesterday_label, |p| &p.yesterday),
    ];

    for (title, label, seats_of) in periods {
        let _ = writeln!(msg, "\n📅 <b>{title} ({label})</b>");
        let mut period_total = 0;
        for perf in summary {
            let seats = seats_of(perf);
            if seats.is_empty() {
                continue;
            }
            period_total += seats.values().sum::<u32>();
            let date = if perf.date.is_empty() {
                String::new()
            } else {
                format!(" ({})", perf.date)
            };
            let _ = writeln!(msg, "  🎵 {}{}", perf.name, date);
            let _ = writeln!(msg, "      {}", seat_list(seats));
        }
        if period_total == 0 {
            msg.push_str("  주문 없음\n");
        } else {
            let _ = writeln!(msg, "  💰 합계: <b>{period_total}매</b>");
        }
    }

    let _ = write!(msg, "\n{DIVIDER}\n📊 <b>공연별 총 판매 (취소 제외)</b>\n");
    let mut grand_total = 0;
    for perf in summary.iter().filter(|p| !p.total.is_empty()) {
        let perf_total: u32 = perf.total.values().sum();
        grand_total += perf_total;
        let date = if perf.date.is_empty() {
            String::new()
        } else {
            format!(" {}", perf.date)
        };
        let _ = write!(
            msg,
            "\n🎵 {}{}\n    <b>{}매</b> ({})\n",
            perf.name,
            date,
            perf_total,
            seat_list(&perf.total)
        );
    }
    let _ = write!(msg, "\n🎯 <b>전체 합계: {grand_total}매</b>");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppSettings;
    use crate::report::kst;
    use chrono::TimeZone;

    const DAEGU: &str = "[대구] MelON(멜론) 디즈니 + 지브리 오케스트라 콘서트 [비지정석] 대구, S석";
    const DAEJEON: &str = "[대전] MelON(멜론) 지브리 & 뮤지컬 콘서트 [비지정석] 대전, R석";

    fn row(date: NaiveDate, product: &str, quantity: u32, status: &str) -> SalesRow {
        SalesRow {
            date,
            product: product.to_string(),
            quantity,
            status: status.to_string(),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn key_falls_back_for_unknown_shapes() {
        assert_eq!(
            performance_key(DAEGU),
            ("대구_디즈니".to_string(), "S석".to_string())
        );
        assert_eq!(
            performance_key("무제 상품"),
            ("기타_지브리".to_string(), "미분류".to_string())
        );
    }

    #[test]
    fn summary_splits_days_and_skips_cancellations() {
        let performances = AppSettings::default().performances;
        let rows = vec![
            row(day(10), DAEGU, 2, "배송준비"),
            row(day(10), DAEGU, 1, "취소완료"),
            row(day(9), DAEGU, 1, "발송완료"),
            row(day(1), DAEGU, 3, "배송완료"),
            row(day(10), DAEJEON, 1, "결제완료"),
        ];

        let summary = summarize(&rows, &performances, day(10));
        assert_eq!(summary.len(), 2);

        let daegu = &summary[0];
        assert_eq!(daegu.name, "대구 디즈니+지브리");
        assert_eq!(daegu.today.get("S석"), Some(&2));
        assert_eq!(daegu.yesterday.get("S석"), Some(&1));
        assert_eq!(daegu.total.get("S석"), Some(&6));

        assert_eq!(summary[1].key, "대전_지브리");
    }

    #[test]
    fn report_lists_periods_and_totals() {
        let performances = AppSettings::default().performances;
        let rows = vec![
            row(day(10), DAEGU, 2, "배송준비"),
            row(day(1), DAEJEON, 1, "배송완료"),
        ];
        let summary = summarize(&rows, &performances, day(10));
        let now = kst().with_ymd_and_hms(2026, 3, 10, 14, 5, 0).single().unwrap();

        let report = format_store_report(&summary, day(10), &now);
        assert!(report.starts_with("📦 <b>네이버 스토어 판매현황</b>\n📅 3/10(화) 14시 05분 조회\n"));
        assert!(report.contains("📅 <b>오늘 (3/10(화))</b>\n  🎵 대구 디즈니+지브리 (3/15(일))\n      S석 2매\n  💰 합계: <b>2매</b>\n"));
        assert!(report.contains("📅 <b>어제 (3/9(월))</b>\n  주문 없음\n"));
        assert!(report.contains("\n🎵 대전 지브리&뮤지컬 3/29(일)\n    <b>1매</b> (R석 1매)\n"));
        assert!(report.ends_with("🎯 <b>전체 합계: 3매</b>"));
    }

    #[test]
    fn empty_report() {
        let now = kst().with_ymd_and_hms(2026, 3, 10, 9, 0, 0).single().unwrap();
        let report = format_store_report(&[], day(10), &now);
        assert!(report.ends_with("\n주문 없음"));
    }
}
