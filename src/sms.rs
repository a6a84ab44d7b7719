//! Confirmation texts through the SMS vendor's web composer.
//!
//! The composer is driven the way an operator would: open the saved-message box, pick the
//! region's template, rewrite the buyer and seat lines, add the buyer's number as the single
//! recipient and confirm the send. Anything missing on the page skips the order instead of
//! sending a half-filled message.

use async_trait::async_trait;
use fantoccini::{Client, Locator};
use regex::{NoExpand, Regex};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::instrument;

use crate::browser::driver::{self, KEY_ENTER, KEY_ESCAPE};
use crate::browser::session::sms_send_page_ready;
use crate::browser::SessionManager;
use crate::config::AppSettings;
use crate::error::Result;
use crate::model::Order;

/// Saved-message textarea sits left of this x coordinate, the recipient box right of it.
const COMPOSER_SPLIT_X: f64 = 800.0;

const LOGIN_REQUIRED_NOTICE: &str = "로그인 후 사용이 가능합니다";

fn buyer_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"- 예매자: .+").unwrap())
}

fn seat_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"- 좌석: .+").unwrap())
}

fn recipient_count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"전체\s*(\d+)\s*명").unwrap())
}

/// Why an order was left unsent without it being an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoRegion,
    TemplateMissing(String),
    ComposerMissing,
    RecipientNotAdded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoRegion => write!(f, "지역 정보 없음"),
            SkipReason::TemplateMissing(title) => write!(f, "템플릿 없음: {title}"),
            SkipReason::ComposerMissing => write!(f, "문자 입력창 없음"),
            SkipReason::RecipientNotAdded => write!(f, "받는사람 추가 안 됨"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmsOutcome {
    Sent,
    Skipped(SkipReason),
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_confirmation(&self, order: &Order) -> Result<SmsOutcome>;
}

/// One pass through the composer.
enum Attempt {
    Done(SmsOutcome),
    LoggedOut,
}

pub struct SmsConsole {
    sessions: Arc<SessionManager>,
    settings: Arc<AppSettings>,
}

impl SmsConsole {
    pub fn new(sessions: Arc<SessionManager>, settings: Arc<AppSettings>) -> Self {
        Self { sessions, settings }
    }
}

#[async_trait]
impl SmsSender for SmsConsole {
    #[instrument(skip(self, order), fields(order_id = %order.order_id))]
    async fn send_confirmation(&self, order: &Order) -> Result<SmsOutcome> {
        let Some(region) = order.region(&self.settings.sms.regions) else {
            tracing::warn!(product = %order.product, "No region in product, not sending");
            return Ok(SmsOutcome::Skipped(SkipReason::NoRegion));
        };
        let title = self.settings.sms.template_title(region);

        let mut session = self.sessions.sms().await?;
        let mut relogged = false;
        loop {
            let settings = self.settings.clone();
            let order = order.clone();
            let title = title.clone();
            let attempt = session
                .run(
                    "sms send",
                    self.settings.browser.scrape_timeout(),
                    |client| async move { compose_and_send(&client, &settings, &order, &title).await },
                )
                .await?;

            match attempt {
                Attempt::Done(outcome) => {
                    tracing::info!(outcome = ?outcome, "SMS attempt finished");
                    return Ok(outcome);
                }
                Attempt::LoggedOut if !relogged => {
                    tracing::warn!("SMS composer logged out, re-logging in once");
                    relogged = true;
                    if let Err(e) = session.relogin().await {
                        tracing::warn!(error = %e, "Re-login before retry failed");
                        return Err(session.expired().await);
                    }
                }
                Attempt::LoggedOut => return Err(session.expired().await),
            }
        }
    }
}

async fn compose_and_send(
    client: &Client,
    settings: &AppSettings,
    order: &Order,
    title: &str,
) -> Result<Attempt> {
    let nav = Duration::from_secs(settings.browser.navigation_timeout_secs);
    driver::goto(client, &settings.sms.send_url, nav).await?;
    driver::settle(Duration::from_secs(3)).await;
    if !sms_send_page_ready(&driver::body_text(client).await?) {
        return Ok(Attempt::LoggedOut);
    }

    if !driver::try_click(
        client,
        Locator::XPath("//button[contains(., '내 문자함')]"),
        Duration::from_secs(5),
    )
    .await
    {
        return Ok(Attempt::Done(SmsOutcome::Skipped(SkipReason::ComposerMissing)));
    }
    driver::settle(Duration::from_secs(2)).await;
    if driver::body_text(client).await?.contains(LOGIN_REQUIRED_NOTICE) {
        driver::press_key(client, KEY_ESCAPE).await?;
        return Ok(Attempt::LoggedOut);
    }

    if !driver::try_click_text(client, title, Duration::from_secs(5)).await {
        tracing::warn!(template = %title, "Saved message not found");
        driver::press_key(client, KEY_ESCAPE).await?;
        return Ok(Attempt::Done(SmsOutcome::Skipped(SkipReason::TemplateMissing(
            title.to_string(),
        ))));
    }
    driver::settle(Duration::from_millis(1500)).await;
    driver::press_key(client, KEY_ESCAPE).await?;
    driver::settle(Duration::from_millis(1500)).await;
    // Short-message conversion notice, when the template is long.
    driver::try_click(client, Locator::Css(".jconfirm button"), Duration::from_secs(2)).await;

    let mut message_box = None;
    let mut recipient_box = None;
    for textarea in client.find_all(Locator::Css("textarea.user_message")).await? {
        let (x, _, _, _) = textarea.rectangle().await?;
        if x < COMPOSER_SPLIT_X {
            message_box.get_or_insert(textarea);
        } else {
            recipient_box.get_or_insert(textarea);
        }
    }

    if let Some(textarea) = &message_box {
        let content = textarea.prop("value").await?.unwrap_or_default();
        let filled = fill_template(&content, order);
        textarea.clone().click().await?;
        driver::set_value(client, textarea, &filled).await?;
        driver::settle(Duration::from_millis(500)).await;
        tracing::info!(
            buyer = %order.display_name(),
            seat = ?order.seat(),
            quantity = order.quantity,
            "Template filled"
        );
    } else {
        tracing::warn!("Message textarea not found, sending template unchanged");
    }

    let Some(recipient) = recipient_box else {
        return Ok(Attempt::Done(SmsOutcome::Skipped(SkipReason::ComposerMissing)));
    };
    recipient.clone().click().await?;
    recipient.clear().await?;
    recipient
        .send_keys(&format!("{}{KEY_ENTER}", order.phone_digits()))
        .await?;
    driver::settle(Duration::from_secs(2)).await;
    // "1건 추가되었습니다"
    driver::try_click(
        client,
        Locator::Css(".jconfirm button.btn-default"),
        Duration::from_secs(2),
    )
    .await;

    let recipients = recipient_count(&driver::body_text(client).await?);
    if recipients == 0 {
        return Ok(Attempt::Done(SmsOutcome::Skipped(SkipReason::RecipientNotAdded)));
    }
    tracing::info!(recipients, "Recipient added");

    client
        .find(Locator::Css("#btn_sendRequest"))
        .await?
        .click()
        .await?;
    driver::settle(Duration::from_secs(2)).await;
    if driver::try_click(
        client,
        Locator::XPath(
            "//button[contains(@class, 'btn_b') and contains(@class, 'bg_blue') and contains(., '확인')]",
        ),
        Duration::from_secs(5),
    )
    .await
    {
        driver::settle(Duration::from_secs(2)).await;
    } else {
        tracing::warn!("Send confirmation button not found");
    }

    Ok(Attempt::Done(SmsOutcome::Sent))
}

/// Rewrites the template's buyer and seat lines for one order. Other lines are untouched.
pub fn fill_template(content: &str, order: &Order) -> String {
    let name = match order.display_name() {
        name if name.is_empty() => "고객".to_string(),
        name => name,
    };
    let buyer_line = format!("- 예매자: {}님 (뒷자리 {})", name, order.phone_last4());
    let seat = order.seat().unwrap_or_else(|| "석".to_string());
    let seat_line = format!("- 좌석: {} {}매 (비지정석)", seat, order.quantity.max(1));

    let content = buyer_line_re().replace(content, NoExpand(&buyer_line));
    seat_line_re()
        .replace(&content, NoExpand(&seat_line))
        .into_owned()
}

/// Recipient count shown under the recipient box, `0` when absent.
pub fn recipient_count(page_text: &str) -> u32 {
    recipient_count_re()
        .captures(page_text)
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample_order;

    const TEMPLATE: &str = "[멜론] 대구 공연 예매 완료\n\
        - 예매자: 홍길동님 (뒷자리 0000)\n\
        - 좌석: R석 1매 (비지정석)\n\
        - 일시: 3/15(일) 17:00";

    #[test]
    fn fill_template_rewrites_buyer_and_seat() {
        let mut order = sample_order("1");
        order.buyer_name = "김영희".to_string();
        order.recipient_name = Some("박민수".to_string());

        let filled = fill_template(TEMPLATE, &order);
        assert!(filled.contains("- 예매자: 김영희(박민수)님 (뒷자리 5678)"));
        assert!(filled.contains("- 좌석: S석 2매 (비지정석)"));
        assert!(filled.starts_with("[멜론] 대구 공연 예매 완료\n"));
        assert!(filled.ends_with("- 일시: 3/15(일) 17:00"));
    }

    #[test]
    fn fill_template_defaults_missing_fields() {
        let mut order = sample_order("1");
        order.buyer_name = String::new();
        order.product = "[대구] 좌석 정보 없음".to_string();
        order.phone = "12".to_string();

        let filled = fill_template(TEMPLATE, &order);
        assert!(filled.contains("- 예매자: 고객님 (뒷자리 0000)"));
        assert!(filled.contains("- 좌석: 석 2매 (비지정석)"));
    }

    #[test]
    fn fill_template_keeps_dollar_signs_literal() {
        let mut order = sample_order("1");
        order.buyer_name = "$1".to_string();
        let filled = fill_template(TEMPLATE, &order);
        assert!(filled.contains("- 예매자: $1님"));
    }

    #[test]
    fn template_without_placeholders_is_unchanged() {
        let order = sample_order("1");
        assert_eq!(fill_template("안녕하세요", &order), "안녕하세요");
    }

    #[test]
    fn recipient_count_reads_summary() {
        assert_eq!(recipient_count("받는사람 전체 1 명 | 중복 0"), 1);
        assert_eq!(recipient_count("전체12명"), 12);
        assert_eq!(recipient_count("받는사람 없음"), 0);
    }

    #[test]
    fn skip_reasons_read_as_korean() {
        assert_eq!(SkipReason::NoRegion.to_string(), "지역 정보 없음");
        assert_eq!(
            SkipReason::TemplateMissing("[멜론] 대구 공연 예매 완료".into()).to_string(),
            "템플릿 없음: [멜론] 대구 공연 예매 완료"
        );
    }
}
