use chrono::NaiveDate;
use regex::Regex;
use scraper::Html;
use std::sync::OnceLock;

use super::table_rows;

const STATUS_WORDS: [&str; 4] = ["배송", "결제", "취소", "발송"];

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(20\d{2}\.\d{2}\.\d{2})").unwrap())
}

fn quantity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,2}$").unwrap())
}

/// One line of the order-management search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalesRow {
    pub date: NaiveDate,
    pub product: String,
    pub quantity: u32,
    pub status: String,
}

impl SalesRow {
    pub fn is_cancelled(&self) -> bool {
        self.status.contains("취소")
    }
}

pub fn parse_sales_rows(html: &str) -> Vec<SalesRow> {
    let document = Html::parse_document(html);
    table_rows(&document)
        .iter()
        .filter_map(|cells| sales_row_from_cells(cells))
        .collect()
}

fn sales_row_from_cells(cells: &[String]) -> Option<SalesRow> {
    let date = cells.iter().find_map(|c| {
        let caps = date_re().captures(c)?;
        NaiveDate::parse_from_str(&caps[1], "%Y.%m.%d").ok()
    })?;

    // On equal length the later cell wins.
    let product = cells
        .iter()
        .max_by_key(|c| c.chars().count())
        .cloned()
        .unwrap_or_default();

    let quantity = cells
        .iter()
        .filter(|c| quantity_re().is_match(c))
        .filter_map(|c| c.parse::<u32>().ok())
        .find(|q| *q > 0)
        .unwrap_or(1);

    let status = cells
        .iter()
        .find(|c| STATUS_WORDS.iter().any(|w| c.contains(w)))
        .cloned()
        .unwrap_or_default();

    Some(SalesRow {
        date,
        product,
        quantity,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT: &str = "[대구] MelON(멜론) 디즈니 + 지브리 오케스트라 콘서트 [비지정석] 대구, S석";

    fn row(cells: &[&str]) -> String {
        let tds: String = cells.iter().map(|c| format!("<td>{c}</td>")).collect();
        format!("<tr>{tds}</tr>")
    }

    #[test]
    fn parses_dated_rows_only() {
        let html = format!(
            "<table><tbody>{}{}{}</tbody></table>",
            row(&["2025030112345678", "2025.03.01 10:22:01", PRODUCT, "0", "2", "배송준비"]),
            row(&["합계", "12"]),
            row(&["2025030187654321", "2025.02.28 09:00:00", PRODUCT, "취소완료"]),
        );

        let rows = parse_sales_rows(&html);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        assert_eq!(rows[0].product, PRODUCT);
        assert_eq!(rows[0].quantity, 2);
        assert_eq!(rows[0].status, "배송준비");
        assert!(!rows[0].is_cancelled());

        assert_eq!(rows[1].quantity, 1);
        assert!(rows[1].is_cancelled());
    }
}
