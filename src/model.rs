use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

fn seat_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*(\S+석)\s*$").unwrap())
}

/// One of the two independently authenticated vendor consoles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Site {
    Storefront,
    Sms,
}

impl Site {
    pub const ALL: [Site; 2] = [Site::Storefront, Site::Sms];

    pub fn snapshot_file(self) -> &'static str {
        match self {
            Site::Storefront => "storefront-state.json",
            Site::Sms => "sms-state.json",
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Site::Storefront => write!(f, "스마트스토어"),
            Site::Sms => write!(f, "뿌리오"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    New,
    PendingApproval,
    Processed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    /// Product/performance line, e.g. `[대구] ... 대구, S석`.
    pub product: String,
    pub buyer_name: String,
    #[serde(default)]
    pub recipient_name: Option<String>,
    pub phone: String,
    pub quantity: u32,
    #[serde(default)]
    pub status: OrderStatus,
}

impl Order {
    /// `buyer(recipient)` when somebody else receives the tickets.
    pub fn display_name(&self) -> String {
        match &self.recipient_name {
            Some(recipient) if recipient != &self.buyer_name => {
                format!("{}({})", self.buyer_name, recipient)
            }
            _ => self.buyer_name.clone(),
        }
    }

    pub fn phone_digits(&self) -> String {
        self.phone.chars().filter(|c| c.is_ascii_digit()).collect()
    }

    pub fn phone_last4(&self) -> String {
        phone_last4(&self.phone)
    }

    pub fn seat(&self) -> Option<String> {
        seat_of(&self.product)
    }

    /// First configured region named anywhere in the product line.
    pub fn region<'a>(&self, regions: &'a [String]) -> Option<&'a str> {
        regions
            .iter()
            .filter_map(|r| self.product.find(r.as_str()).map(|pos| (pos, r.as_str())))
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, r)| r)
    }
}

/// Seat grade from the trailing `, S석` of a product line.
pub fn seat_of(product: &str) -> Option<String> {
    seat_re()
        .captures(product)
        .map(|caps| caps[1].to_string())
}

pub fn phone_last4(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return "0000".to_string();
    }
    digits[digits.len() - 4..].iter().collect()
}

/// SMS went out; shipping still has to be marked by hand in the storefront.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub order_id: String,
    pub buyer_name: String,
    pub product: String,
    pub quantity: u32,
    pub sms_at: DateTime<Utc>,
}

impl PendingDelivery {
    pub fn from_order(order: &Order, sms_at: DateTime<Utc>) -> Self {
        Self {
            order_id: order.order_id.clone(),
            buyer_name: order.display_name(),
            product: order.product.clone(),
            quantity: order.quantity,
            sms_at,
        }
    }
}

/// Manually registered cancellation, subtracted during final reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledOrder {
    pub buyer_name: String,
    pub phone_last4: String,
    #[serde(default)]
    pub product: String,
    pub cancelled_at: DateTime<Utc>,
}

/// Cancellation request seen in the storefront's cancel view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub order_id: String,
    pub info: String,
}

/// One confirmation SMS that actually went out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsRecord {
    pub order_id: String,
    pub buyer_name: String,
    pub phone_last4: String,
    pub product: String,
    pub seat: String,
    pub quantity: u32,
    pub sent_at: DateTime<Utc>,
}

impl SmsRecord {
    pub fn from_order(order: &Order, sent_at: DateTime<Utc>) -> Self {
        Self {
            order_id: order.order_id.clone(),
            buyer_name: order.buyer_name.clone(),
            phone_last4: order.phone_last4(),
            product: order.product.clone(),
            seat: order.seat().unwrap_or_default(),
            quantity: order.quantity,
            sent_at,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_order(id: &str) -> Order {
    Order {
        order_id: id.to_string(),
        product: "[대구] MelON(멜론) 디즈니 + 지브리 오케스트라 콘서트 [비지정석] 대구, S석"
            .to_string(),
        buyer_name: "홍길동".to_string(),
        recipient_name: None,
        phone: "010-1234-5678".to_string(),
        quantity: 2,
        status: OrderStatus::New,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_includes_distinct_recipient() {
        let mut order = sample_order("1");
        assert_eq!(order.display_name(), "홍길동");
        order.recipient_name = Some("김철수".to_string());
        assert_eq!(order.display_name(), "홍길동(김철수)");
        order.recipient_name = Some("홍길동".to_string());
        assert_eq!(order.display_name(), "홍길동");
    }

    #[test]
    fn seat_and_phone_helpers() {
        let order = sample_order("1");
        assert_eq!(order.seat().as_deref(), Some("S석"));
        assert_eq!(order.phone_last4(), "5678");
        assert_eq!(order.phone_digits(), "01012345678");
        assert_eq!(phone_last4("12"), "0000");
        assert_eq!(seat_of("no seat here"), None);
    }

    #[test]
    fn region_picks_earliest_match() {
        let regions: Vec<String> = ["대전", "대구"].iter().map(|s| s.to_string()).collect();
        let order = sample_order("1");
        assert_eq!(order.region(&regions), Some("대구"));

        let mut other = sample_order("2");
        other.product = "[기타] 공연, R석".to_string();
        assert_eq!(other.region(&regions), None);
    }
}
