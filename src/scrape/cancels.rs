use regex::Regex;
use scraper::{Html, Selector};
use std::sync::OnceLock;

use super::cell_text;
use crate::model::CancelRequest;

const INFO_CHARS: usize = 100;

fn order_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{16,})").unwrap())
}

/// Every row of the cancel view that mentions a product order number.
pub fn parse_cancel_requests(html: &str) -> Vec<CancelRequest> {
    let document = Html::parse_document(html);
    let row_selector = Selector::parse("table tbody tr, .order-item").unwrap();
    let cell_selector = Selector::parse("td").unwrap();

    document
        .select(&row_selector)
        .filter_map(|row| {
            let cells: Vec<String> = row.select(&cell_selector).map(cell_text).collect();
            let text = if cells.is_empty() {
                cell_text(row)
            } else {
                cells.join("\t")
            };
            let order_id = order_id_re().captures(&text)?[1].to_string();
            Some(CancelRequest {
                order_id,
                info: text.chars().take(INFO_CHARS).collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_order_numbers_in_rows() {
        let html = "<table><tbody>\
            <tr><td>2025030112345678</td><td>취소요청</td><td>홍길동</td></tr>\
            <tr><td>안내</td><td>취소 요청 건이 없습니다</td></tr>\
            </tbody></table>\
            <div class=\"order-item\">주문 2025030199990000 취소</div>";

        let cancels = parse_cancel_requests(html);
        assert_eq!(cancels.len(), 2);
        assert_eq!(cancels[0].order_id, "2025030112345678");
        assert_eq!(cancels[0].info, "2025030112345678\t취소요청\t홍길동");
        assert_eq!(cancels[1].order_id, "2025030199990000");
    }

    #[test]
    fn info_is_truncated() {
        let long = "가".repeat(300);
        let html = format!("<table><tbody><tr><td>2025030112345678 {long}</td></tr></tbody></table>");
        let cancels = parse_cancel_requests(&html);
        assert_eq!(cancels[0].info.chars().count(), INFO_CHARS);
    }
}
