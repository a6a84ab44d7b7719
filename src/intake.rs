//! Order intake: detection, operator approval and the confirmation text.
//!
//! Per order ID: `unseen → pending approval → processed`, or back to `unseen` on reject or on a
//! failed send. An ID is never both pending and processed. Between approval and the end of its
//! send the ID sits in an in-flight set, outside both, and polls skip it.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use teloxide::utils::html;
use tracing::instrument;

use crate::error::{BotError, Result};
use crate::ledger::SmsLedger;
use crate::model::{
    seat_of, CancelRequest, CancelledOrder, Order, OrderStatus, PendingDelivery, SmsRecord,
};
use crate::notify::{Action, Notifier};
use crate::sms::{SkipReason, SmsOutcome, SmsSender};
use crate::store::IntakeStores;
use crate::storefront::{OrderScan, OrderSource};

pub const APPROVE_PREFIX: &str = "approve_";
pub const REJECT_PREFIX: &str = "reject_";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub new_orders: Vec<String>,
    pub new_cancels: Vec<String>,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Sent,
    Skipped(SkipReason),
    Failed(String),
    SessionExpired,
    /// Unknown ID, or its approval is already running.
    NotPending,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntakeCounts {
    pub pending: usize,
    pub processed: usize,
    pub deliveries: usize,
    pub cancelled: usize,
    pub in_flight: usize,
}

pub struct IntakePipeline {
    source: Arc<dyn OrderSource>,
    sms: Arc<dyn SmsSender>,
    notifier: Arc<dyn Notifier>,
    ledger: SmsLedger,
    stores: Mutex<IntakeStores>,
    in_flight: Mutex<HashSet<String>>,
    poll_lock: tokio::sync::Mutex<()>,
}

impl IntakePipeline {
    pub fn new(
        source: Arc<dyn OrderSource>,
        sms: Arc<dyn SmsSender>,
        notifier: Arc<dyn Notifier>,
        stores: IntakeStores,
        ledger: SmsLedger,
    ) -> Self {
        Self {
            source,
            sms,
            notifier,
            ledger,
            stores: Mutex::new(stores),
            in_flight: Mutex::new(HashSet::new()),
            poll_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn stores(&self) -> MutexGuard<'_, IntakeStores> {
        match self.stores.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn ledger(&self) -> &SmsLedger {
        &self.ledger
    }

    /// One detection cycle: new orders go to the operator for approval, new cancellation
    /// requests are reported once, and the processed lists are pruned.
    #[instrument(skip(self))]
    pub async fn poll(&self) -> Result<PollReport> {
        let Ok(_running) = self.poll_lock.try_lock() else {
            tracing::info!("Order check already running");
            return Err(BotError::Busy("주문 확인 진행 중".to_string()));
        };

        let OrderScan {
            orders: scraped,
            cancels,
        } = self.source.scan().await?;
        let fresh: Vec<Order> = {
            let stores = self.stores();
            let in_flight = self.in_flight();
            scraped
                .into_iter()
                .filter(|o| {
                    !stores.processed.contains(&o.order_id)
                        && !stores.pending.get().contains_key(&o.order_id)
                        && !in_flight.contains(&o.order_id)
                })
                .collect()
        };

        let mut report = PollReport::default();
        for order in fresh {
            let order_id = order.order_id.clone();
            self.request_approval(order).await?;
            report.new_orders.push(order_id);
        }

        match self.check_cancellations(cancels).await {
            Ok(ids) => report.new_cancels = ids,
            Err(e) => tracing::warn!(error = %e, "Cancellation check failed"),
        }

        {
            let mut stores = self.stores();
            for (name, result) in [
                ("processed orders", stores.processed.prune()),
                ("processed cancels", stores.processed_cancels.prune()),
            ] {
                if let Err(e) = result {
                    tracing::warn!(list = name, error = %e, "Pruning failed");
                }
            }
            report.pending = stores.pending.get().len();
        }

        tracing::info!(
            new_orders = report.new_orders.len(),
            new_cancels = report.new_cancels.len(),
            pending = report.pending,
            "Order check finished"
        );
        Ok(report)
    }

    /// Asks the operator first; the order only becomes pending once the prompt went out.
    async fn request_approval(&self, mut order: Order) -> Result<()> {
        self.notifier
            .send_with_actions(&approval_text(&order), &approval_actions(&order.order_id))
            .await?;

        order.status = OrderStatus::PendingApproval;
        let mut stores = self.stores();
        stores.pending.get_mut().insert(order.order_id.clone(), order);
        stores.pending.save()
    }

    async fn check_cancellations(
        &self,
        requests: Result<Vec<CancelRequest>>,
    ) -> Result<Vec<String>> {
        let requests = requests?;
        let mut reported = Vec::new();
        for request in requests {
            let known = self.stores().processed_cancels.contains(&request.order_id);
            if known || reported.contains(&request.order_id) {
                continue;
            }
            tracing::warn!(order_id = %request.order_id, info = %request.info, "New cancellation request");
            self.notifier.send(&cancel_text(&request.order_id)).await?;
            self.stores().processed_cancels.push(request.order_id.clone())?;
            reported.push(request.order_id);
        }
        Ok(reported)
    }

    /// Sends the confirmation text for a pending order. Only a sent text marks it processed.
    #[instrument(skip(self))]
    pub async fn approve(&self, order_id: &str) -> Result<ApprovalOutcome> {
        let order = {
            let mut stores = self.stores();
            let Some(order) = stores.pending.get_mut().remove(order_id) else {
                return Ok(ApprovalOutcome::NotPending);
            };
            self.in_flight().insert(order_id.to_string());
            stores.pending.save()?;
            order
        };

        self.notify(&format!(
            "⏳ <b>{}</b> 주문 처리 중... 문자 발송을 시작합니다.",
            html::escape(&order.display_name())
        ))
        .await;

        let result = self.sms.send_confirmation(&order).await;
        let outcome = match result {
            Ok(SmsOutcome::Sent) => {
                let recorded = self.record_sent(&order);
                self.in_flight().remove(order_id);
                recorded?;
                self.notify(&format!(
                    "✅ <b>문자 발송 완료!</b>\n\n주문: {}\n구매자: {}\n\n⚠️ 배송처리는 직접 해주세요.",
                    order.order_id,
                    html::escape(&order.display_name())
                ))
                .await;
                return Ok(ApprovalOutcome::Sent);
            }
            Ok(SmsOutcome::Skipped(reason)) => {
                tracing::warn!(reason = %reason, "Confirmation not sent");
                self.notify(&format!(
                    "⚠️ <b>문자 발송 실패</b>\n\n주문: {}\n사유: {}\n다음 체크 때 다시 알려드릴게요.",
                    order.order_id, reason
                ))
                .await;
                ApprovalOutcome::Skipped(reason)
            }
            Err(e) if e.is_session_expired() => {
                self.notify(&format!(
                    "⚠️ <b>뿌리오 세션 만료</b>\n\n\"ppuriologin\" 명령으로 재로그인 해주세요.\n\
                     주문 {}은 다음 체크 때 다시 알려드릴게요.",
                    order.order_id
                ))
                .await;
                ApprovalOutcome::SessionExpired
            }
            Err(e) => {
                tracing::error!(error = %e, "Confirmation send failed");
                self.notify(&format!(
                    "⚠️ <b>문자 발송 실패</b>\n\n주문: {}\n오류: {}\n다음 체크 때 다시 알려드릴게요.",
                    order.order_id,
                    html::escape(&e.to_string())
                ))
                .await;
                ApprovalOutcome::Failed(e.to_string())
            }
        };

        self.in_flight().remove(order_id);
        Ok(outcome)
    }

    fn record_sent(&self, order: &Order) -> Result<()> {
        let now = Utc::now();
        {
            let mut stores = self.stores();
            stores.processed.push(order.order_id.clone())?;
            stores
                .deliveries
                .get_mut()
                .push(PendingDelivery::from_order(order, now));
            stores.deliveries.save()?;
        }
        if let Err(e) = self.ledger.append(&SmsRecord::from_order(order, now)) {
            tracing::error!(order_id = %order.order_id, error = %e, "Ledger append failed");
        }
        Ok(())
    }

    /// Snoozes a pending order: it is not marked processed, so the next poll asks again.
    #[instrument(skip(self))]
    pub async fn reject(&self, order_id: &str) -> Result<bool> {
        let was_pending = {
            let mut stores = self.stores();
            let removed = stores.pending.get_mut().remove(order_id).is_some();
            if removed {
                stores.pending.save()?;
            }
            removed
        };
        self.notify(&format!("⏸ 주문 {order_id} 보류 (다음 체크 때 다시 알림)"))
            .await;
        Ok(was_pending)
    }

    pub fn is_pending(&self, order_id: &str) -> bool {
        self.stores().pending.get().contains_key(order_id)
    }

    pub fn pending_orders(&self) -> Vec<Order> {
        self.stores().pending.get().values().cloned().collect()
    }

    pub fn pending_deliveries(&self) -> Vec<PendingDelivery> {
        self.stores().deliveries.get().clone()
    }

    /// Marks every waiting delivery as shipped. Returns how many there were.
    pub fn clear_deliveries(&self) -> Result<usize> {
        let mut stores = self.stores();
        let count = stores.deliveries.get().len();
        if count > 0 {
            stores.deliveries.get_mut().clear();
            stores.deliveries.save()?;
            tracing::info!(count, "Pending deliveries cleared");
        }
        Ok(count)
    }

    pub fn counts(&self) -> IntakeCounts {
        let stores = self.stores();
        IntakeCounts {
            pending: stores.pending.get().len(),
            processed: stores.processed.len(),
            deliveries: stores.deliveries.get().len(),
            cancelled: stores.cancelled.get().len(),
            in_flight: self.in_flight().len(),
        }
    }

    /// Adds a buyer to the reconciliation denylist. The product comes from the latest matching
    /// ledger entry, when there is one.
    pub fn register_cancellation(&self, buyer_name: &str, phone_last4: &str) -> Result<CancelledOrder> {
        let product = self
            .ledger
            .load()?
            .into_iter()
            .rev()
            .find(|r| r.buyer_name == buyer_name && r.phone_last4 == phone_last4)
            .map(|r| r.product)
            .unwrap_or_default();

        let cancelled = CancelledOrder {
            buyer_name: buyer_name.to_string(),
            phone_last4: phone_last4.to_string(),
            product,
            cancelled_at: Utc::now(),
        };
        let mut stores = self.stores();
        stores.cancelled.get_mut().push(cancelled.clone());
        stores.cancelled.save()?;
        tracing::info!(buyer = %buyer_name, last4 = %phone_last4, "Cancellation registered");
        Ok(cancelled)
    }

    pub fn cancelled_orders(&self) -> Vec<CancelledOrder> {
        self.stores().cancelled.get().clone()
    }

    async fn notify(&self, text: &str) {
        if let Err(e) = self.notifier.send(text).await {
            tracing::error!(error = %e, "Failed to notify operator");
        }
    }
}

pub fn approval_text(order: &Order) -> String {
    let quantity = if order.quantity > 1 {
        format!(" ({}매)", order.quantity)
    } else {
        String::new()
    };
    let phone = if order.phone.is_empty() {
        String::new()
    } else {
        format!("📱 연락처: {}\n", html::escape(&order.phone))
    };
    format!(
        "📦 <b>새 주문!</b>\n\n🎫 공연: {}{}\n👤 구매자: {}\n{}\n주문번호: {}",
        html::escape(&order.product),
        quantity,
        html::escape(&order.display_name()),
        phone,
        order.order_id
    )
}

/// The approve/reject buttons under an approval prompt.
pub fn approval_actions(order_id: &str) -> [Action; 2] {
    [
        Action::new("✅ 승인", format!("{APPROVE_PREFIX}{order_id}")),
        Action::new("❌ 거부", format!("{REJECT_PREFIX}{order_id}")),
    ]
}

fn cancel_text(order_id: &str) -> String {
    format!("⚠️ <b>취소 요청!</b>\n\n주문번호: {order_id}\n\n스마트스토어에서 직접 확인해주세요.")
}

/// Reminder of texts sent but not yet marked shipped, or `None` when nothing waits.
pub fn delivery_reminder(deliveries: &[PendingDelivery]) -> Option<String> {
    if deliveries.is_empty() {
        return None;
    }
    let mut text = format!(
        "📬 <b>발송처리 대기 ({}건)</b>\n문자발송 완료, 발송처리 필요!\n",
        deliveries.len()
    );
    for delivery in deliveries {
        let seat = seat_of(&delivery.product).unwrap_or_default();
        let quantity = if delivery.quantity > 1 {
            format!(" {}매", delivery.quantity)
        } else {
            String::new()
        };
        text.push_str(&format!(
            "\n• {} - {}{}",
            html::escape(&delivery.buyer_name),
            seat,
            quantity
        ));
    }
    text.push_str("\n\n✅ 발송처리 완료 후 <b>발송완료</b> 입력");
    Some(text)
}
