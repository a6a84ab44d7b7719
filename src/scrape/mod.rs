//! HTML → record extraction for the storefront's order console.
//!
//! Everything here is a pure function of page source so the heuristics can be pinned down
//! with captured fixtures. Rows that do not yield a complete record are dropped silently.

pub mod cancels;
pub mod orders;
pub mod sales;

use scraper::{ElementRef, Html, Selector};

pub use cancels::parse_cancel_requests;
pub use orders::parse_orders;
pub use sales::{parse_sales_rows, SalesRow};

/// Trimmed text of every `td` in every `table tbody tr`, one vector per row.
pub(crate) fn table_rows(document: &Html) -> Vec<Vec<String>> {
    let row_selector = Selector::parse("table tbody tr").unwrap();
    let cell_selector = Selector::parse("td").unwrap();

    document
        .select(&row_selector)
        .map(|row| row.select(&cell_selector).map(cell_text).collect())
        .collect()
}

pub(crate) fn cell_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}
