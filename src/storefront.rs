//! Storefront order console: new orders, cancellation requests and the sales search.

use async_trait::async_trait;
use fantoccini::{Client, Locator};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::browser::driver;
use crate::browser::SessionManager;
use crate::config::AppSettings;
use crate::error::{BotError, Result};
use crate::model::{CancelRequest, Order};
use crate::scrape::{self, SalesRow};

/// One pass over the order console: new orders plus the cancellation view.
///
/// A failing cancellation view does not discard the orders already read.
#[derive(Debug)]
pub struct OrderScan {
    pub orders: Vec<Order>,
    pub cancels: Result<Vec<CancelRequest>>,
}

/// Where new orders and cancellation requests come from.
#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn scan(&self) -> Result<OrderScan>;
}

pub struct StorefrontSource {
    sessions: Arc<SessionManager>,
    settings: Arc<AppSettings>,
}

impl StorefrontSource {
    pub fn new(sessions: Arc<SessionManager>, settings: Arc<AppSettings>) -> Self {
        Self { sessions, settings }
    }

    /// Three months of order-management rows, for the store sales report.
    #[instrument(skip(self))]
    pub async fn sales_rows(&self) -> Result<Vec<SalesRow>> {
        let mut session = self.sessions.storefront().await?;
        let settings = self.settings.clone();
        session
            .run(
                "store sales search",
                self.settings.browser.scrape_timeout(),
                |client| async move { fetch_sales_rows(&client, &settings).await },
            )
            .await
    }
}

#[async_trait]
impl OrderSource for StorefrontSource {
    /// Both views are read under one session guard, so no other storefront job can move the
    /// browser between them.
    #[instrument(skip(self))]
    async fn scan(&self) -> Result<OrderScan> {
        let mut session = self.sessions.storefront().await?;
        let limit = self.settings.browser.scrape_timeout();

        let settings = self.settings.clone();
        let orders = session
            .run("new order scrape", limit, |client| async move {
                fetch_new_orders(&client, &settings).await
            })
            .await?;

        let settings = self.settings.clone();
        let cancels = session
            .run("cancel scrape", limit, |client| async move {
                fetch_cancel_requests(&client, &settings).await
            })
            .await;

        Ok(OrderScan { orders, cancels })
    }
}

fn nav_timeout(settings: &AppSettings) -> Duration {
    Duration::from_secs(settings.browser.navigation_timeout_secs)
}

async fn open_view(client: &Client, settings: &AppSettings, url: &str, wait: Duration) -> Result<()> {
    driver::goto(client, url, nav_timeout(settings)).await?;
    driver::settle(wait).await;
    if driver::try_click_text(client, &settings.storefront.popup_dismiss_text, Duration::from_secs(2)).await {
        tracing::debug!("Dismissed storefront popup");
    }
    driver::settle(Duration::from_secs(1)).await;
    Ok(())
}

async fn fetch_new_orders(client: &Client, settings: &AppSettings) -> Result<Vec<Order>> {
    let storefront = &settings.storefront;
    open_view(client, settings, &storefront.delivery_url, Duration::from_secs(5)).await?;
    driver::enter_frame(client, &storefront.delivery_frame)
        .await
        .map_err(|_| BotError::ElementNotFound("배송관리 프레임".to_string()))?;

    let mut orders = Vec::new();
    for card in &storefront.new_order_cards {
        if let Err(e) = driver::click_text(client, card, Duration::from_secs(3)).await {
            tracing::warn!(card = %card, error = %e, "Order card unavailable");
            continue;
        }
        driver::settle(Duration::from_secs(3)).await;

        let found = scrape::parse_orders(&client.source().await?);
        tracing::info!(card = %card, orders = found.len(), "Scanned order card");
        orders.extend(found);
    }
    client.enter_frame(None).await?;

    let mut seen = HashSet::new();
    orders.retain(|order| seen.insert(order.order_id.clone()));
    tracing::info!(orders = orders.len(), "New orders found");
    Ok(orders)
}

async fn fetch_cancel_requests(client: &Client, settings: &AppSettings) -> Result<Vec<CancelRequest>> {
    let storefront = &settings.storefront;
    open_view(client, settings, &storefront.cancel_url, Duration::from_secs(4)).await?;

    let source = match driver::frame_source(client, &storefront.cancel_frame).await {
        Ok(source) => source,
        Err(e) => {
            tracing::debug!(error = %e, "Cancel frame missing, reading the page itself");
            client.source().await?
        }
    };
    let cancels = scrape::parse_cancel_requests(&source);
    tracing::info!(cancels = cancels.len(), "Cancellation requests found");
    Ok(cancels)
}

async fn fetch_sales_rows(client: &Client, settings: &AppSettings) -> Result<Vec<SalesRow>> {
    let storefront = &settings.storefront;
    open_view(client, settings, &storefront.manage_url, Duration::from_secs(5)).await?;
    driver::enter_frame(client, &storefront.manage_frame)
        .await
        .map_err(|_| BotError::ElementNotFound("주문 프레임".to_string()))?;

    driver::try_click_text(client, "3개월", Duration::from_secs(3)).await;
    driver::settle(Duration::from_millis(500)).await;
    if !driver::try_click(client, Locator::Css(".btn-search"), Duration::from_secs(3)).await {
        tracing::warn!("Search button not found in order frame");
    }
    driver::settle(Duration::from_secs(8)).await;

    // The search reloads the frame, so enter it again before reading.
    let source = driver::frame_source(client, &storefront.manage_frame).await?;
    let rows = scrape::parse_sales_rows(&source);
    tracing::info!(rows = rows.len(), "Store sales rows read");
    Ok(rows)
}
