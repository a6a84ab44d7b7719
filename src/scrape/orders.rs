//! New-order table of the delivery view.
//!
//! The grid renders each order twice: a narrow header row carrying the 16+ digit product
//! order number, and a wide data row with everything else. All header rows come first, then
//! the data rows in the same order, so the i-th header belongs to the i-th data row. Column
//! positions drift between page variants, so fields are found by pattern where possible.

use regex::Regex;
use scraper::Html;
use std::ops::RangeInclusive;
use std::sync::OnceLock;

use super::table_rows;
use crate::model::{Order, OrderStatus};

pub const HEADER_CELLS: RangeInclusive<usize> = 3..=10;
pub const MIN_DATA_CELLS: usize = 15;

const BUYER_CELL: usize = 9;
const RECIPIENT_CELLS: RangeInclusive<usize> = 10..=20;
const QUANTITY_CELL: usize = 24;

fn order_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{16,}$").unwrap())
}

fn product_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[.+\].*석$").unwrap())
}

fn korean_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[가-힣]{2,4}$").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^01[0-9]-?\d{3,4}-?\d{4}$").unwrap())
}

pub fn parse_orders(html: &str) -> Vec<Order> {
    let document = Html::parse_document(html);
    let mut header_ids = Vec::new();
    let mut data_rows = Vec::new();

    for cells in table_rows(&document) {
        if cells.is_empty() {
            continue;
        }
        if HEADER_CELLS.contains(&cells.len()) {
            if let Some(id) = cells.iter().find(|c| order_id_re().is_match(c)) {
                header_ids.push(id.clone());
            }
            continue;
        }
        if cells.len() >= MIN_DATA_CELLS {
            data_rows.push(cells);
        }
    }

    if header_ids.len() != data_rows.len() {
        tracing::warn!(
            headers = header_ids.len(),
            data_rows = data_rows.len(),
            "Order table header and data row counts differ"
        );
    }

    data_rows
        .iter()
        .zip(header_ids)
        .filter_map(|(cells, order_id)| order_from_cells(order_id, cells))
        .collect()
}

/// Builds an order from one data row, or `None` when a required field is missing.
pub fn order_from_cells(order_id: String, cells: &[String]) -> Option<Order> {
    let product = cells.iter().find(|c| product_re().is_match(c))?.clone();
    let buyer_name = cells.get(BUYER_CELL).filter(|c| !c.is_empty())?.clone();
    let phone = cells.iter().find(|c| phone_re().is_match(c))?.clone();

    let recipient_name = RECIPIENT_CELLS
        .filter_map(|j| cells.get(j))
        .find(|c| *c != &buyer_name && korean_name_re().is_match(c))
        .cloned();

    let quantity = cells
        .get(QUANTITY_CELL)
        .and_then(|c| leading_number(c))
        .filter(|q| *q > 0)
        .unwrap_or(1);

    Some(Order {
        order_id,
        product,
        buyer_name,
        recipient_name,
        phone,
        quantity,
        status: OrderStatus::New,
    })
}

/// Integer prefix of a cell such as `2` or `2개`.
fn leading_number(text: &str) -> Option<u32> {
    let digits: String = text
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_row(order_id: &str) -> String {
        format!("<tr><td><input type=checkbox></td><td>{order_id}</td><td>신규주문</td></tr>")
    }

    fn data_row(product: &str, buyer: &str, recipient: &str, phone: &str, qty: &str) -> String {
        let mut cells = vec![String::new(); 30];
        cells[3] = product.to_string();
        cells[9] = buyer.to_string();
        cells[11] = recipient.to_string();
        cells[14] = phone.to_string();
        cells[24] = qty.to_string();
        let tds: String = cells.iter().map(|c| format!("<td> {c} </td>")).collect();
        format!("<tr>{tds}</tr>")
    }

    fn table(rows: &[String]) -> String {
        format!(
            "<html><body><table><tbody>{}</tbody></table></body></html>",
            rows.concat()
        )
    }

    const PRODUCT: &str = "[대전] MelON(멜론) 지브리 & 뮤지컬 콘서트 [비지정석] 대전, R석";

    #[test]
    fn pairs_headers_with_data_rows_in_order() {
        let html = table(&[
            header_row("2025030112345678"),
            header_row("2025030187654321"),
            data_row(PRODUCT, "홍길동", "김철수", "010-1234-5678", "2"),
            data_row(PRODUCT, "이영희", "이영희", "01098765432", ""),
        ]);

        let orders = parse_orders(&html);
        assert_eq!(orders.len(), 2);

        assert_eq!(orders[0].order_id, "2025030112345678");
        assert_eq!(orders[0].buyer_name, "홍길동");
        assert_eq!(orders[0].recipient_name.as_deref(), Some("김철수"));
        assert_eq!(orders[0].display_name(), "홍길동(김철수)");
        assert_eq!(orders[0].quantity, 2);
        assert_eq!(orders[0].product, PRODUCT);

        assert_eq!(orders[1].order_id, "2025030187654321");
        assert_eq!(orders[1].recipient_name, None);
        assert_eq!(orders[1].phone, "01098765432");
        assert_eq!(orders[1].quantity, 1);
    }

    #[test]
    fn drops_rows_missing_required_fields() {
        let html = table(&[
            header_row("2025030112345678"),
            header_row("2025030187654321"),
            data_row(PRODUCT, "홍길동", "", "02-123-4567", "1"),
            data_row("상품명 없음", "이영희", "", "010-1111-2222", "1"),
        ]);
        assert!(parse_orders(&html).is_empty());
    }

    #[test]
    fn data_row_without_header_is_ignored() {
        let html = table(&[data_row(PRODUCT, "홍길동", "", "010-1234-5678", "1")]);
        assert!(parse_orders(&html).is_empty());
    }

    #[test]
    fn narrow_rows_without_ids_are_not_headers() {
        let html = table(&[
            "<tr><td>합계</td><td>3</td><td>-</td></tr>".to_string(),
            header_row("2025030112345678"),
            data_row(PRODUCT, "홍길동", "", "010-1234-5678", "3매"),
        ]);
        let orders = parse_orders(&html);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].quantity, 3);
    }

    fn row(cells: &[String]) -> String {
        let tds: String = cells.iter().map(|c| format!("<td>{c}</td>")).collect();
        format!("<tr>{tds}</tr>")
    }

    fn header_with_cells(order_id: &str, width: usize) -> String {
        let mut cells = vec!["-".to_string(); width];
        cells[1] = order_id.to_string();
        row(&cells)
    }

    fn data_with_cells(buyer: &str, width: usize) -> String {
        let mut cells = vec![String::new(); width];
        cells[3] = PRODUCT.to_string();
        cells[BUYER_CELL] = buyer.to_string();
        cells[12] = "010-1234-5678".to_string();
        row(&cells)
    }

    #[test]
    fn header_rows_span_three_to_ten_cells() {
        let html = table(&[
            header_with_cells("2025030100000002", 2),
            header_with_cells("2025030100000003", *HEADER_CELLS.start()),
            header_with_cells("2025030100000010", *HEADER_CELLS.end()),
            header_with_cells("2025030100000011", HEADER_CELLS.end() + 1),
            data_with_cells("홍길동", MIN_DATA_CELLS),
            data_with_cells("이영희", MIN_DATA_CELLS),
        ]);
        let ids: Vec<String> = parse_orders(&html).into_iter().map(|o| o.order_id).collect();
        assert_eq!(ids, vec!["2025030100000003", "2025030100000010"]);
    }

    #[test]
    fn data_rows_need_the_minimum_width() {
        let html = table(&[
            header_row("2025030112345678"),
            header_row("2025030187654321"),
            data_with_cells("이영희", MIN_DATA_CELLS - 1),
            data_with_cells("홍길동", MIN_DATA_CELLS),
        ]);
        let orders = parse_orders(&html);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, "2025030112345678");
        assert_eq!(orders[0].buyer_name, "홍길동");
        assert_eq!(orders[0].quantity, 1);
    }

    #[test]
    fn empty_page_yields_nothing() {
        assert!(parse_orders("<html><body>주문 없음</body></html>").is_empty());
    }
}
