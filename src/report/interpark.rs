//! Daily sales from the ticketing vendor's admin console.
//!
//! The console renders its data in canvas grids, so rows are read from the grid's data
//! provider and from the `DailySalesInfoList` response captured by a request hook. Each run
//! logs in with a fresh browser that is closed again afterwards.

use chrono::{DateTime, Days, FixedOffset, NaiveDate};
use fantoccini::{Client, Locator};
use serde_json::{json, Value};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

use super::{format_won, time_label, weekday_ko, DIVIDER};
use crate::browser::driver;
use crate::config::AppSettings;
use crate::error::{BotError, Result};

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(15);
const CAPTURE_POLL: Duration = Duration::from_millis(500);
const RUN_TIMEOUT: Duration = Duration::from_secs(300);

const LOOKUP_ROWS_JS: &str = r#"
const p = window.LookupGrid_Provider;
if (!p || typeof p.getRowCount !== 'function') return [];
const rows = [];
for (let i = 0; i < p.getRowCount(); i++) rows.push(p.getJsonRow(i));
return rows;
"#;

const SELECT_PERFORMANCE_DATE_JS: &str = r#"
const s = document.querySelector('select');
if (!s) return false;
s.value = 'P';
s.dispatchEvent(new Event('change', { bubbles: true }));
return true;
"#;

/// Double-clicks the lookup grid row holding `arguments[0]` as its goods code.
const PICK_GOODS_JS: &str = r#"
const code = String(arguments[0]);
const p = window.LookupGrid_Provider;
const canvas = document.querySelector('#LookupGrid_lookupGoods canvas');
if (!p || !canvas) return null;
let index = -1;
for (let i = 0; i < p.getRowCount(); i++) {
  if (String(p.getJsonRow(i).GoodsCode) === code) { index = i; break; }
}
if (index < 0) return null;
const grid = window.LookupGrid_lookupGoods;
const top = grid && typeof grid.getTopItem === 'function' ? grid.getTopItem() : 0;
let rowHeight = 20, headerHeight = 25;
if (grid && typeof grid.displayOptions === 'function') {
  const opts = grid.displayOptions();
  rowHeight = opts.rowHeight || 20;
  headerHeight = opts.headerHeight || 25;
}
const box = canvas.getBoundingClientRect();
const x = box.left + 150;
const y = box.top + headerHeight + (index - top) * rowHeight + rowHeight / 2;
for (const type of ['mousedown', 'mouseup', 'click', 'mousedown', 'mouseup', 'click', 'dblclick']) {
  canvas.dispatchEvent(new MouseEvent(type, { bubbles: true, cancelable: true, view: window, clientX: x, clientY: y, detail: type === 'dblclick' ? 2 : 1 }));
}
return index;
"#;

const SELECTED_CODE_JS: &str = r#"
const input = document.querySelector('input#txtGoodsCode, input[name="GoodsCode"]');
return input ? input.value : null;
"#;

/// Records the body of the next `DailySalesInfoList` response in `window.__dailySales`.
const HOOK_DAILY_SALES_JS: &str = r#"
window.__dailySales = null;
if (!window.__dailySalesHooked) {
  window.__dailySalesHooked = true;
  const open = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function (method, url) {
    this.__url = String(url);
    return open.apply(this, arguments);
  };
  const send = XMLHttpRequest.prototype.send;
  XMLHttpRequest.prototype.send = function () {
    this.addEventListener('load', function () {
      if (this.__url && this.__url.indexOf('DailySalesInfoList') !== -1) {
        window.__dailySales = this.responseText;
      }
    });
    return send.apply(this, arguments);
  };
  if (window.fetch) {
    const originalFetch = window.fetch;
    window.fetch = function (input) {
      const url = typeof input === 'string' ? input : (input && input.url) || '';
      return originalFetch.apply(this, arguments).then(function (response) {
        if (url.indexOf('DailySalesInfoList') !== -1) {
          response.clone().text().then(function (text) { window.__dailySales = text; });
        }
        return response;
      });
    };
  }
}
return true;
"#;

const CAPTURED_DAILY_SALES_JS: &str = "return window.__dailySales;";

/// Rows of the first non-lookup grid provider that has any.
const PROVIDER_ROWS_JS: &str = r#"
for (const key of Object.keys(window)) {
  if (!key.endsWith('_Provider') || key.indexOf('Lookup') !== -1) continue;
  const p = window[key];
  if (p && typeof p.getRowCount === 'function' && p.getRowCount() > 0) {
    const rows = [];
    for (let i = 0; i < p.getRowCount(); i++) rows.push(p.getJsonRow(i));
    return rows;
  }
}
return null;
"#;

/// A product from the goods lookup grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goods {
    pub name: String,
    pub venue: String,
    /// `yyyymmdd`
    pub start_date: String,
    pub code: String,
}

impl Goods {
    pub fn start(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&digits(&self.start_date), "%Y%m%d").ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyRow {
    /// `yyyymmdd`
    pub date: String,
    pub count: i64,
    pub amount: i64,
    pub total_seats: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductSales {
    pub goods: Goods,
    pub today: Option<DailyRow>,
    pub yesterday: Option<DailyRow>,
    pub total: i64,
    /// Sell-through in whole percent.
    pub rate: i64,
}

impl ProductSales {
    pub fn empty(goods: Goods) -> Self {
        Self {
            goods,
            today: None,
            yesterday: None,
            total: 0,
            rate: 0,
        }
    }
}

fn digits(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn field_text(row: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| match row.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

fn field_i64(row: &Value, keys: &[&str]) -> i64 {
    keys.iter()
        .find_map(|key| match row.get(*key) {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
            Some(Value::String(s)) => digits(s).parse().ok(),
            _ => None,
        })
        .unwrap_or(0)
}

pub fn parse_goods(rows: &Value) -> Vec<Goods> {
    rows.as_array()
        .map(|rows| {
            rows.iter()
                .map(|row| Goods {
                    name: field_text(row, &["GoodsName"]),
                    venue: field_text(row, &["PlaceName"]),
                    start_date: field_text(row, &["SDate"]),
                    code: field_text(row, &["GoodsCode"]),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Products whose first performance is today or later. Undated products are dropped.
pub fn upcoming(goods: Vec<Goods>, today: NaiveDate) -> Vec<Goods> {
    goods
        .into_iter()
        .filter(|g| g.start().is_some_and(|start| start >= today))
        .collect()
}

/// Daily rows from a captured response body (possibly JSON encoded twice) or a provider dump.
pub fn parse_daily(value: &Value) -> Option<Vec<DailyRow>> {
    let rows = match value {
        Value::String(body) => return parse_daily(&serde_json::from_str(body).ok()?),
        Value::Array(rows) => rows,
        Value::Object(response) => {
            if response.get("ErrorCode").and_then(Value::as_i64) != Some(0) {
                tracing::warn!(error = %field_text(value, &["ErrorText"]), "Daily sales request failed");
                return None;
            }
            response.get("Data")?.as_array()?
        }
        _ => return None,
    };
    if rows.is_empty() {
        return None;
    }
    Some(
        rows.iter()
            .map(|row| DailyRow {
                date: digits(&field_text(row, &["Bdate", "BkDate", "SaleDate"])),
                count: field_i64(row, &["BCnt", "DayCnt", "BkCnt"]),
                amount: field_i64(row, &["BAmt", "DayAmt", "BkAmt"]),
                total_seats: field_i64(row, &["TotSeatCnt"]),
            })
            .collect(),
    )
}

/// Today's and yesterday's rows, the running total and the sell-through against the seat
/// count carried on the last row.
pub fn summarize_daily(goods: Goods, rows: &[DailyRow], today: NaiveDate) -> ProductSales {
    let today_key = today.format("%Y%m%d").to_string();
    let yesterday_key = today
        .checked_sub_days(Days::new(1))
        .map(|d| d.format("%Y%m%d").to_string())
        .unwrap_or_default();

    let total: i64 = rows.iter().map(|r| r.count).sum();
    let seats = rows.last().map(|r| r.total_seats).unwrap_or(0);
    let rate = if seats > 0 {
        (total as f64 / seats as f64 * 100.0).round() as i64
    } else {
        0
    };

    ProductSales {
        goods,
        today: rows.iter().find(|r| r.date == today_key).cloned(),
        yesterday: rows.iter().find(|r| r.date == yesterday_key).cloned(),
        total,
        rate,
    }
}

pub fn d_day_label(start: NaiveDate, today: NaiveDate) -> String {
    match (start - today).num_days() {
        0 => "D-Day".to_string(),
        n => format!("D-{n}"),
    }
}

/// `3/15일`
fn compact_date_label(date: NaiveDate) -> String {
    format!("{}{}", date.format("%-m/%-d"), weekday_ko(date))
}

pub fn format_interpark_report(
    sales: &[ProductSales],
    today: NaiveDate,
    now: &DateTime<FixedOffset>,
) -> String {
    let today_label = compact_date_label(today);
    let yesterday_label = today
        .checked_sub_days(Days::new(1))
        .map(compact_date_label)
        .unwrap_or_default();

    let mut msg = format!(
        "🎫 <b>일별 판매현황</b>\n📅 {} {} 조회\n{DIVIDER}\n\n",
        today_label,
        time_label(now)
    );
    if sales.is_empty() {
        msg.push_str("조회할 공연이 없습니다.");
        return msg;
    }

    let mut today_total = 0;
    let mut yesterday_total = 0;
    for product in sales {
        let performance = match product.goods.start() {
            Some(start) => format!(
                "{} {}",
                start.format("%-m/%-d"),
                d_day_label(start, today)
            ),
            None => String::new(),
        };
        let day = |row: &Option<DailyRow>| {
            row.as_ref()
                .map(|r| (r.count, r.amount))
                .unwrap_or((0, 0))
        };
        let (today_count, today_amount) = day(&product.today);
        let (yesterday_count, yesterday_amount) = day(&product.yesterday);
        today_total += today_count;
        yesterday_total += yesterday_count;

        let _ = write!(
            msg,
            "🎵 <b>{}</b> ({})\n   오늘({}): {}매 / {}원\n   어제({}): {}매 / {}원\n   누계: {}매 ({}%)\n\n",
            teloxide::utils::html::escape(&product.goods.venue),
            performance,
            today_label,
            today_count,
            format_won(today_amount),
            yesterday_label,
            yesterday_count,
            format_won(yesterday_amount),
            product.total,
            product.rate
        );
    }
    let _ = write!(
        msg,
        "{DIVIDER}\n💰 <b>오늘 총계</b>: {today_total}매\n💰 <b>어제 총계</b>: {yesterday_total}매"
    );
    msg
}

/// Logs into the ticketing console and collects daily sales for every upcoming product.
pub struct InterparkReporter {
    settings: Arc<AppSettings>,
    running: Mutex<()>,
}

impl InterparkReporter {
    pub fn new(settings: Arc<AppSettings>) -> Self {
        Self {
            settings,
            running: Mutex::new(()),
        }
    }

    /// The formatted report. A second call while one is running fails with `Busy`.
    #[instrument(skip(self))]
    pub async fn report(&self) -> Result<String> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(BotError::Busy("놀티켓 조회 진행 중".to_string()));
        };
        let credentials = &self.settings.interpark;
        if credentials.username.is_empty() || credentials.password.is_empty() {
            return Err(BotError::Config("interpark credentials are not set".into()));
        }

        let now = super::kst_now();
        let today = now.date_naive();
        let client = driver::connect(&self.settings.browser, self.settings.browser.headless).await?;
        let collected = tokio::time::timeout(RUN_TIMEOUT, self.collect(&client, today)).await;
        if let Err(e) = client.close().await {
            tracing::debug!(error = %e, "Closing interpark browser failed");
        }

        let sales = collected.map_err(|_| BotError::Timeout("interpark report".into()))??;
        tracing::info!(products = sales.len(), "Interpark sales collected");
        Ok(format_interpark_report(&sales, today, &now))
    }

    async fn collect(&self, client: &Client, today: NaiveDate) -> Result<Vec<ProductSales>> {
        self.login(client).await?;

        let nav = Duration::from_secs(self.settings.browser.navigation_timeout_secs);
        driver::goto(client, &self.settings.interpark.sales_url, nav).await?;
        driver::settle(Duration::from_secs(2)).await;
        client.execute(SELECT_PERFORMANCE_DATE_JS, vec![]).await?;

        open_goods_lookup(client).await?;
        let goods = parse_goods(&client.execute(LOOKUP_ROWS_JS, vec![]).await?);
        let goods = upcoming(goods, today);
        tracing::info!(upcoming = goods.len(), "Products to report");

        let mut sales = Vec::with_capacity(goods.len());
        for (i, product) in goods.into_iter().enumerate() {
            if i > 0 {
                client.refresh().await?;
                driver::settle(Duration::from_millis(1500)).await;
            }
            match self.product_sales(client, &product, today).await {
                Ok(result) => sales.push(result),
                Err(e) => {
                    tracing::warn!(code = %product.code, venue = %product.venue, error = %e, "Product sales unavailable");
                    sales.push(ProductSales::empty(product));
                }
            }
        }
        Ok(sales)
    }

    async fn login(&self, client: &Client) -> Result<()> {
        let credentials = &self.settings.interpark;
        let nav = Duration::from_secs(self.settings.browser.navigation_timeout_secs);
        driver::goto(client, &credentials.login_url, nav).await?;

        let wait = Duration::from_secs(10);
        client
            .wait()
            .at_most(wait)
            .for_element(Locator::Css(r#"input[placeholder="아이디"]"#))
            .await?
            .send_keys(&credentials.username)
            .await?;
        client
            .find(Locator::Css(r#"input[placeholder="비밀번호"]"#))
            .await?
            .send_keys(&credentials.password)
            .await?;
        client
            .find(Locator::XPath("//button[contains(., '로그인')]"))
            .await?
            .click()
            .await?;
        driver::settle(Duration::from_secs(3)).await;

        if driver::body_text(client)
            .await?
            .contains("2단계 인증을 설정해주세요")
        {
            tracing::info!("Skipping two-factor setup prompt");
            driver::click_text(client, "진행하지 않음", Duration::from_secs(3)).await?;
            driver::settle(Duration::from_millis(500)).await;
            driver::try_click(
                client,
                Locator::XPath("//button[contains(., '확인')]"),
                Duration::from_secs(3),
            )
            .await;
            driver::settle(Duration::from_secs(1)).await;
        }
        tracing::info!("Interpark login submitted");
        Ok(())
    }

    async fn product_sales(&self, client: &Client, product: &Goods, today: NaiveDate) -> Result<ProductSales> {
        client.execute(SELECT_PERFORMANCE_DATE_JS, vec![]).await?;
        open_goods_lookup(client).await?;

        let picked = client
            .execute(PICK_GOODS_JS, vec![json!(product.code)])
            .await?;
        if picked.is_null() {
            return Err(BotError::ElementNotFound(format!("goods {}", product.code)));
        }
        driver::settle(Duration::from_millis(1500)).await;
        let selected = client.execute(SELECTED_CODE_JS, vec![]).await?;
        if selected.as_str() != Some(product.code.as_str()) {
            tracing::warn!(expected = %product.code, selected = ?selected, "Lookup selection differs");
        }

        client.execute(SELECT_PERFORMANCE_DATE_JS, vec![]).await?;
        client.execute(HOOK_DAILY_SALES_JS, vec![]).await?;
        client.find(Locator::Css("#btnSearch")).await?.click().await?;

        let rows = match capture_daily_sales(client).await? {
            Some(rows) => rows,
            None => {
                tracing::debug!(code = %product.code, "No captured response, reading grid provider");
                driver::settle(Duration::from_secs(1)).await;
                parse_daily(&client.execute(PROVIDER_ROWS_JS, vec![]).await?)
                    .ok_or_else(|| BotError::ElementNotFound("daily sales grid".into()))?
            }
        };
        Ok(summarize_daily(product.clone(), &rows, today))
    }
}

async fn open_goods_lookup(client: &Client) -> Result<()> {
    client
        .wait()
        .at_most(Duration::from_secs(10))
        .for_element(Locator::Css("#btnSearch_lookupGoods"))
        .await?
        .click()
        .await?;
    driver::settle(Duration::from_secs(2)).await;
    Ok(())
}

async fn capture_daily_sales(client: &Client) -> Result<Option<Vec<DailyRow>>> {
    let deadline = tokio::time::Instant::now() + CAPTURE_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        let captured = client.execute(CAPTURED_DAILY_SALES_JS, vec![]).await?;
        if !captured.is_null() {
            return Ok(parse_daily(&captured));
        }
        tokio::time::sleep(CAPTURE_POLL).await;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::kst;
    use chrono::TimeZone;

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, d).unwrap()
    }

    fn goods(venue: &str, start: &str) -> Goods {
        Goods {
            name: format!("{venue} 콘서트"),
            venue: venue.to_string(),
            start_date: start.to_string(),
            code: "26001234".to_string(),
        }
    }

    #[test]
    fn goods_accept_numeric_fields() {
        let rows = json!([
            { "GoodsName": "디즈니 콘서트", "PlaceName": "대구 엑스코", "SDate": 20260315, "GoodsCode": 26001234 },
            { "GoodsName": "지브리", "PlaceName": "대전", "SDate": "20260301", "GoodsCode": "26000001" }
        ]);
        let parsed = parse_goods(&rows);
        assert_eq!(parsed[0].start_date, "20260315");
        assert_eq!(parsed[0].code, "26001234");

        let future = upcoming(parsed, day(3, 10));
        assert_eq!(future.len(), 1);
        assert_eq!(future[0].venue, "대구 엑스코");
    }

    #[test]
    fn upcoming_keeps_today_and_drops_undated() {
        let list = vec![goods("a", "20260310"), goods("b", ""), goods("c", "20260309")];
        let kept = upcoming(list, day(3, 10));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].venue, "a");
    }

    #[test]
    fn daily_response_may_be_double_encoded() {
        let inner = json!({
            "ErrorCode": 0,
            "Data": [
                { "Bdate": "20260309", "BCnt": 4, "BAmt": 352000, "TotSeatCnt": 0 },
                { "Bdate": "20260310", "BCnt": 2, "BAmt": 176000, "TotSeatCnt": 1200 }
            ]
        });
        let body = Value::String(inner.to_string());
        let rows = parse_daily(&Value::String(body.to_string())).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].total_seats, 1200);

        assert!(parse_daily(&json!({ "ErrorCode": 1, "ErrorText": "denied" })).is_none());
        assert!(parse_daily(&Value::Null).is_none());
    }

    #[test]
    fn provider_rows_use_alternate_field_names() {
        let rows = parse_daily(&json!([{ "BkDate": "2026.03.10", "DayCnt": "3", "DayAmt": 90000 }])).unwrap();
        assert_eq!(rows[0].date, "20260310");
        assert_eq!(rows[0].count, 3);
        assert_eq!(rows[0].amount, 90000);
    }

    #[test]
    fn summary_totals_and_rate() {
        let rows = vec![
            DailyRow { date: "20260308".into(), count: 10, amount: 880000, total_seats: 0 },
            DailyRow { date: "20260309".into(), count: 4, amount: 352000, total_seats: 0 },
            DailyRow { date: "20260310".into(), count: 2, amount: 176000, total_seats: 1200 },
        ];
        let sales = summarize_daily(goods("대구", "20260315"), &rows, day(3, 10));
        assert_eq!(sales.total, 16);
        assert_eq!(sales.rate, 1);
        assert_eq!(sales.today.as_ref().unwrap().count, 2);
        assert_eq!(sales.yesterday.as_ref().unwrap().amount, 352000);

        let none = summarize_daily(goods("대구", "20260315"), &[], day(3, 10));
        assert_eq!((none.total, none.rate), (0, 0));
    }

    #[test]
    fn d_day_labels() {
        assert_eq!(d_day_label(day(3, 10), day(3, 10)), "D-Day");
        assert_eq!(d_day_label(day(3, 15), day(3, 10)), "D-5");
    }

    #[test]
    fn report_format() {
        let now = kst().with_ymd_and_hms(2026, 3, 10, 9, 0, 0).single().unwrap();
        let rows = vec![
            DailyRow { date: "20260309".into(), count: 4, amount: 352000, total_seats: 0 },
            DailyRow { date: "20260310".into(), count: 2, amount: 176000, total_seats: 100 },
        ];
        let sales = vec![summarize_daily(goods("대구 엑스코", "20260315"), &rows, day(3, 10))];

        let report = format_interpark_report(&sales, day(3, 10), &now);
        assert!(report.starts_with("🎫 <b>일별 판매현황</b>\n📅 3/10화 9시 00분 조회\n"));
        assert!(report.contains(
            "🎵 <b>대구 엑스코</b> (3/15 D-5)\n   오늘(3/10화): 2매 / 176,000원\n   어제(3/9월): 4매 / 352,000원\n   누계: 6매 (6%)\n\n"
        ));
        assert!(report.ends_with("💰 <b>오늘 총계</b>: 2매\n💰 <b>어제 총계</b>: 4매"));

        let empty = format_interpark_report(&[], day(3, 10), &now);
        assert!(empty.ends_with("조회할 공연이 없습니다."));
    }
}
