//! Operator commands typed into the chat.

use std::sync::Arc;
use std::time::Instant;
use sysinfo::{Pid, System};
use teloxide::utils::html;
use tracing::instrument;

use crate::browser::SessionManager;
use crate::config::AppSettings;
use crate::error::{BotError, Result};
use crate::intake::{approval_actions, approval_text, delivery_reminder, IntakePipeline};
use crate::model::Site;
use crate::notify::Notifier;
use crate::report::interpark::InterparkReporter;
use crate::report::{kst_now, reconcile, store};
use crate::storefront::StorefrontSource;
use crate::telegram::Connectivity;

const CANCEL_USAGE: &str = "사용법: <code>취소등록 이름 뒷자리4</code>\n예) 취소등록 홍길동 5678";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    CombinedReport,
    SalesReport,
    CheckOrders,
    DeliveriesDone,
    DeliveryList,
    PendingApprovals,
    SmsRelogin,
    Restart,
    StoreReport,
    ReconcileList,
    ReconcileDetail(usize),
    RegisterCancel {
        buyer_name: String,
        phone_last4: String,
    },
    CancelList,
    Status,
    Help,
    /// Recognised keyword with unusable arguments; carries the usage text.
    Invalid(&'static str),
}

impl CommandKind {
    /// Commands the group chat may run.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            CommandKind::CombinedReport | CommandKind::SalesReport | CommandKind::StoreReport
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Personal,
    Group,
}

/// Maps chat text to a command. Unknown text and commands outside the scope are `None`.
pub fn parse(text: &str, scope: Scope) -> Option<CommandKind> {
    let text = text.trim().to_lowercase();
    let kind = parse_keyword(&text)?;
    match scope {
        Scope::Personal => Some(kind),
        Scope::Group if kind.is_read_only() => Some(kind),
        Scope::Group => None,
    }
}

fn parse_keyword(text: &str) -> Option<CommandKind> {
    let kind = match text {
        "결산" => CommandKind::CombinedReport,
        "sales" | "/sales" | "조회" | "판매현황" | "놀티켓" => CommandKind::SalesReport,
        "check" | "체크" | "확인" | "주문확인" | "주문" => CommandKind::CheckOrders,
        "발송완료" | "발송처리완료" | "배송완료" => CommandKind::DeliveriesDone,
        "발송대기" | "배송대기" => CommandKind::DeliveryList,
        "승인대기" | "대기" | "pending" => CommandKind::PendingApprovals,
        "ppuriologin" | "뿌리오로그인" | "뿌리오재로그인" => CommandKind::SmsRelogin,
        "봇재시작" | "재시작" | "restart" => CommandKind::Restart,
        "스토어" | "스토어현황" | "네이버" | "store" => CommandKind::StoreReport,
        "최종결산" => CommandKind::ReconcileList,
        "취소목록" | "취소내역" => CommandKind::CancelList,
        "status" | "/status" | "상태" => CommandKind::Status,
        "help" | "/help" | "도움말" => CommandKind::Help,
        _ => return parse_with_arguments(text),
    };
    Some(kind)
}

fn parse_with_arguments(text: &str) -> Option<CommandKind> {
    if let Some(rest) = text.strip_prefix("취소등록") {
        let args: Vec<&str> = rest.split_whitespace().collect();
        return Some(match args.as_slice() {
            [name, last4] if last4.len() == 4 && last4.chars().all(|c| c.is_ascii_digit()) => {
                CommandKind::RegisterCancel {
                    buyer_name: name.to_string(),
                    phone_last4: last4.to_string(),
                }
            }
            _ => CommandKind::Invalid(CANCEL_USAGE),
        });
    }
    if let Some(rest) = text.strip_prefix("결산") {
        let n: usize = rest.trim().parse().ok()?;
        return (n > 0).then_some(CommandKind::ReconcileDetail(n));
    }
    None
}

pub fn help_text() -> &'static str {
    "📋 <b>명령어 안내</b>\n\n\
     • <b>결산</b> - 놀티켓 + 네이버 어제/오늘 따로\n\n\
     <b>📊 인터파크</b>\n\
     • sales, 조회, 놀티켓 - 판매현황\n\n\
     <b>📦 스마트스토어</b>\n\
     • 체크, 확인 - 새 주문 확인\n\
     • 스토어, 네이버 - 판매현황 (오늘/어제)\n\
     • 승인대기 - 승인 대기 주문 다시 보기\n\
     • 발송대기 / 발송완료 - 발송처리 대기 목록 / 완료 처리\n\n\
     <b>🧾 정산</b>\n\
     • 최종결산 - 공연별 문자 발송 목록\n\
     • 결산1, 결산2 ... - 공연별 명단\n\
     • 취소등록 이름 뒷자리4 / 취소목록\n\n\
     <b>⚙️ 관리</b>\n\
     • 상태 - 세션과 저장소 상태\n\
     • 뿌리오로그인 - 뿌리오 자동 재로그인\n\
     • 봇재시작 - 브라우저 재초기화\n\n\
     • help, 도움말 - 이 안내"
}

/// Runs commands against the live services and answers into the chat they came from.
pub struct Dispatcher {
    settings: Arc<AppSettings>,
    sessions: Arc<SessionManager>,
    intake: Arc<IntakePipeline>,
    storefront: Arc<StorefrontSource>,
    interpark: Arc<InterparkReporter>,
    connectivity: Arc<Connectivity>,
    started_at: Instant,
}

impl Dispatcher {
    pub fn new(
        settings: Arc<AppSettings>,
        sessions: Arc<SessionManager>,
        intake: Arc<IntakePipeline>,
        storefront: Arc<StorefrontSource>,
        interpark: Arc<InterparkReporter>,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        Self {
            settings,
            sessions,
            intake,
            storefront,
            interpark,
            connectivity,
            started_at: Instant::now(),
        }
    }

    #[instrument(skip(self, out))]
    pub async fn dispatch(&self, kind: CommandKind, out: &dyn Notifier) -> Result<()> {
        match kind {
            CommandKind::CombinedReport => self.combined_report(out).await,
            CommandKind::SalesReport => {
                out.send("🔍 판매현황 조회 중... 약 1분 소요됩니다.").await?;
                match self.interpark.report().await {
                    Ok(report) => out.send(&report).await,
                    Err(e) => out.send(&error_text(&e)).await,
                }
            }
            CommandKind::CheckOrders => self.check_orders(out).await,
            CommandKind::DeliveriesDone => {
                let text = match self.intake.clear_deliveries()? {
                    0 => "📭 발송처리 대기 건이 없습니다.".to_string(),
                    n => format!("✅ {n}건 발송처리 완료 처리됨"),
                };
                out.send(&text).await
            }
            CommandKind::DeliveryList => {
                let text = delivery_reminder(&self.intake.pending_deliveries())
                    .unwrap_or_else(|| "📭 발송처리 대기 건이 없습니다.".to_string());
                out.send(&text).await
            }
            CommandKind::PendingApprovals => {
                let pending = self.intake.pending_orders();
                if pending.is_empty() {
                    return out.send("📭 승인 대기 주문이 없습니다.").await;
                }
                out.send(&format!("⏳ <b>승인 대기 {}건</b>", pending.len()))
                    .await?;
                for order in &pending {
                    out.send_with_actions(&approval_text(order), &approval_actions(&order.order_id))
                        .await?;
                }
                Ok(())
            }
            CommandKind::SmsRelogin => {
                out.send("🔐 뿌리오 자동 재로그인 시도 중...").await?;
                let text = match self.sessions.relogin_sms().await {
                    Ok(()) => "✅ 뿌리오 자동 재로그인 성공!".to_string(),
                    Err(e) => format!(
                        "❌ 자동 재로그인 실패: {}\n\n터미널에서 실행:\n\
                         <code>ticket-order-bot setup sms</code>\n그 후 \"봇재시작\" 입력",
                        html::escape(&e.to_string())
                    ),
                };
                out.send(&text).await
            }
            CommandKind::Restart => {
                out.send("🔄 브라우저 재초기화 중...").await?;
                let result = self.sessions.restart().await;
                let text = match result {
                    Ok(()) => format!("🔄 재시작 완료!\n\n{}", session_summary(&self.sessions)),
                    Err(e) => format!(
                        "❌ 재시작 오류: {}\n\n{}",
                        html::escape(&e.to_string()),
                        session_summary(&self.sessions)
                    ),
                };
                out.send(&text).await
            }
            CommandKind::StoreReport => {
                out.send("📦 스토어 판매현황 조회 중...").await?;
                match self.store_report().await {
                    Ok(report) => out.send(&report).await,
                    Err(e) => out.send(&error_text(&e)).await,
                }
            }
            CommandKind::ReconcileList => {
                let groups = self.ledger_groups()?;
                out.send(&reconcile::format_reconcile_list(
                    &groups,
                    &self.intake.cancelled_orders(),
                ))
                .await
            }
            CommandKind::ReconcileDetail(n) => {
                let groups = self.ledger_groups()?;
                let cancelled = self.intake.cancelled_orders();
                let text = n
                    .checked_sub(1)
                    .and_then(|i| reconcile::format_reconcile_detail(&groups, i, &cancelled))
                    .unwrap_or_else(|| {
                        format!("❌ {n}번 공연이 없습니다. <b>최종결산</b>으로 목록을 먼저 확인하세요.")
                    });
                out.send(&text).await
            }
            CommandKind::RegisterCancel {
                buyer_name,
                phone_last4,
            } => {
                let cancelled = self.intake.register_cancellation(&buyer_name, &phone_last4)?;
                let product = if cancelled.product.is_empty() {
                    "\n⚠️ 발송 기록에서 찾지 못했습니다.".to_string()
                } else {
                    format!("\n🎫 {}", html::escape(&cancelled.product))
                };
                out.send(&format!(
                    "✅ 취소 등록: {} ({}){}",
                    html::escape(&cancelled.buyer_name),
                    cancelled.phone_last4,
                    product
                ))
                .await
            }
            CommandKind::CancelList => {
                out.send(&reconcile::format_cancelled_list(
                    &self.intake.cancelled_orders(),
                ))
                .await
            }
            CommandKind::Status => out.send(&self.status_text()).await,
            CommandKind::Help => out.send(help_text()).await,
            CommandKind::Invalid(usage) => out.send(usage).await,
        }
    }

    /// Ticketing vendor first, then the storefront. Also run by the daily schedule.
    pub async fn combined_report(&self, out: &dyn Notifier) -> Result<()> {
        out.send("📊 결산 조회 중... (놀티켓 → 네이버 순)").await?;

        out.send("🎫 <b>놀티켓 (인터파크)</b> 조회 중... 약 1분 소요.")
            .await?;
        match self.interpark.report().await {
            Ok(report) => out.send(&report).await?,
            Err(e) => {
                tracing::error!(error = %e, "Interpark report failed");
                out.send(&format!("❌ 결산 조회 오류: {}", html::escape(&e.to_string())))
                    .await?;
            }
        }

        out.send("📦 <b>네이버 스토어</b> 조회 중...").await?;
        match self.store_report().await {
            Ok(report) => out.send(&report).await,
            Err(e) => {
                tracing::error!(error = %e, "Store report failed");
                out.send(&format!("❌ 결산 조회 오류: {}", html::escape(&e.to_string())))
                    .await
            }
        }
    }

    async fn check_orders(&self, out: &dyn Notifier) -> Result<()> {
        out.send("🔍 스마트스토어 주문 확인 중...").await?;
        match self.intake.poll().await {
            Ok(report) => {
                self.connectivity.mark_restored();
                if report.new_orders.is_empty() {
                    out.send("✅ 새 주문 없음").await?;
                }
            }
            Err(BotError::Busy(_)) => {
                out.send("⏳ 이미 주문 확인 중입니다. 잠시 후 다시 시도해주세요.")
                    .await?;
            }
            Err(e) => {
                out.send(&format!(
                    "{}\n\n세션 만료 시 <code>ticket-order-bot setup storefront</code> 후 <b>봇재시작</b>",
                    error_text(&e)
                ))
                .await?;
            }
        }
        if let Some(reminder) = delivery_reminder(&self.intake.pending_deliveries()) {
            out.send(&reminder).await?;
        }
        Ok(())
    }

    pub async fn store_report(&self) -> Result<String> {
        let rows = self.storefront.sales_rows().await?;
        let now = kst_now();
        let today = now.date_naive();
        let summary = store::summarize(&rows, &self.settings.performances, today);
        Ok(store::format_store_report(&summary, today, &now))
    }

    fn ledger_groups(&self) -> Result<Vec<reconcile::PerformanceLedger>> {
        let records = self.intake.ledger().load()?;
        Ok(reconcile::group_by_performance(
            records,
            &self.settings.performances,
        ))
    }

    fn status_text(&self) -> String {
        let counts = self.intake.counts();
        let network = if self.connectivity.is_online() {
            "✅ 연결됨"
        } else {
            "❌ 끊김"
        };
        format!(
            "📊 <b>봇 상태</b>\n\n{}\n🌐 네트워크: {}\n\n\
             ⏳ 승인 대기: {}건\n🔄 처리 중: {}건\n📬 발송처리 대기: {}건\n\
             ✅ 처리 완료: {}건\n❌ 취소 등록: {}건\n\n\
             💾 메모리: {:.1} MB\n⏱ 가동 시간: {}",
            session_summary(&self.sessions),
            network,
            counts.pending,
            counts.in_flight,
            counts.deliveries,
            counts.processed,
            counts.cancelled,
            resident_memory_mb(),
            uptime_label(self.started_at.elapsed().as_secs())
        )
    }
}

/// One line per vendor session with its last known state.
pub fn session_summary(sessions: &SessionManager) -> String {
    let states = sessions.status();
    let label = |site: Site| {
        states
            .get(&site)
            .map(|state| state.label())
            .unwrap_or_default()
    };
    format!(
        "📦 스마트스토어: {}\n💬 뿌리오: {}",
        label(Site::Storefront),
        label(Site::Sms)
    )
}

fn error_text(e: &BotError) -> String {
    format!("❌ 오류: {}", html::escape(&e.to_string()))
}

/// Resident memory of this process; `0.0` when it cannot be read.
fn resident_memory_mb() -> f64 {
    let mut sys = System::new_all();
    sys.refresh_all();
    let pid = Pid::from(std::process::id() as usize);
    sys.process(pid)
        .map(|process| process.memory() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

fn uptime_label(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = secs % 86_400 / 3600;
    let minutes = secs % 3600 / 60;
    if days > 0 {
        format!("{days}일 {hours}시간 {minutes}분")
    } else {
        format!("{hours}시간 {minutes}분")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_trimmed_and_case_insensitive() {
        assert_eq!(parse("  CHECK ", Scope::Personal), Some(CommandKind::CheckOrders));
        assert_eq!(parse("체크", Scope::Personal), Some(CommandKind::CheckOrders));
        assert_eq!(parse("/Sales", Scope::Personal), Some(CommandKind::SalesReport));
        assert_eq!(parse("결산", Scope::Personal), Some(CommandKind::CombinedReport));
        assert_eq!(parse("최종결산", Scope::Personal), Some(CommandKind::ReconcileList));
        assert_eq!(parse("PpurioLogin", Scope::Personal), Some(CommandKind::SmsRelogin));
        assert_eq!(parse("안녕하세요", Scope::Personal), None);
    }

    #[test]
    fn reconcile_detail_takes_a_number() {
        assert_eq!(parse("결산2", Scope::Personal), Some(CommandKind::ReconcileDetail(2)));
        assert_eq!(parse("결산 3", Scope::Personal), Some(CommandKind::ReconcileDetail(3)));
        assert_eq!(parse("결산0", Scope::Personal), None);
        assert_eq!(parse("결산abc", Scope::Personal), None);
    }

    #[test]
    fn cancel_registration_needs_name_and_last4() {
        assert_eq!(
            parse("취소등록 홍길동 5678", Scope::Personal),
            Some(CommandKind::RegisterCancel {
                buyer_name: "홍길동".to_string(),
                phone_last4: "5678".to_string(),
            })
        );
        assert_eq!(
            parse("취소등록 홍길동", Scope::Personal),
            Some(CommandKind::Invalid(CANCEL_USAGE))
        );
        assert_eq!(
            parse("취소등록 홍길동 56a8", Scope::Personal),
            Some(CommandKind::Invalid(CANCEL_USAGE))
        );
    }

    #[test]
    fn group_scope_is_read_only() {
        assert_eq!(parse("놀티켓", Scope::Group), Some(CommandKind::SalesReport));
        assert_eq!(parse("스토어", Scope::Group), Some(CommandKind::StoreReport));
        assert_eq!(parse("결산", Scope::Group), Some(CommandKind::CombinedReport));
        assert_eq!(parse("체크", Scope::Group), None);
        assert_eq!(parse("봇재시작", Scope::Group), None);
        assert_eq!(parse("취소등록 홍길동 5678", Scope::Group), None);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(uptime_label(59), "0시간 0분");
        assert_eq!(uptime_label(3 * 3600 + 120), "3시간 2분");
        assert_eq!(uptime_label(2 * 86_400 + 3600), "2일 1시간 0분");
    }
}
