//! Inbound chat transport: long-polls Telegram, routes button presses and typed commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, UpdateKind};
use tracing::instrument;

use crate::browser::SessionManager;
use crate::commands::{self, session_summary, Dispatcher, Scope};
use crate::config::TelegramSettings;
use crate::error::{BotError, Result};
use crate::intake::{IntakePipeline, APPROVE_PREFIX, REJECT_PREFIX};
use crate::notify::{Notifier, TelegramNotifier};

const OFFLINE_BACKOFF: Duration = Duration::from_secs(10);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Whether the last Telegram round trip reached the network.
#[derive(Debug, Default)]
pub struct Connectivity {
    disconnected: AtomicBool,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    /// Returns `true` on the online → offline transition.
    pub fn mark_lost(&self) -> bool {
        !self.disconnected.swap(true, Ordering::SeqCst)
    }

    /// Returns `true` on the offline → online transition.
    pub fn mark_restored(&self) -> bool {
        self.disconnected.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Approve(String),
    Reject(String),
}

pub fn parse_callback(data: &str) -> Option<Callback> {
    if let Some(id) = data.strip_prefix(APPROVE_PREFIX) {
        return (!id.is_empty()).then(|| Callback::Approve(id.to_string()));
    }
    if let Some(id) = data.strip_prefix(REJECT_PREFIX) {
        return (!id.is_empty()).then(|| Callback::Reject(id.to_string()));
    }
    None
}

/// Which commands a chat may run. Chats other than the operator's and the group are ignored.
pub fn scope_of(chat_id: i64, settings: &TelegramSettings) -> Option<Scope> {
    if chat_id == settings.chat_id {
        Some(Scope::Personal)
    } else if settings.group_chat_id == Some(chat_id) {
        Some(Scope::Group)
    } else {
        None
    }
}

pub fn startup_text() -> &'static str {
    "🤖 <b>통합 봇 시작!</b>\n\n📊 sales, 조회 - 인터파크\n📦 체크, 확인 - 스마트스토어"
}

pub struct ChatLoop {
    bot: Bot,
    settings: TelegramSettings,
    dispatcher: Arc<Dispatcher>,
    intake: Arc<IntakePipeline>,
    sessions: Arc<SessionManager>,
    connectivity: Arc<Connectivity>,
    operator: Arc<dyn Notifier>,
}

impl ChatLoop {
    pub fn new(
        bot: Bot,
        settings: TelegramSettings,
        dispatcher: Arc<Dispatcher>,
        intake: Arc<IntakePipeline>,
        sessions: Arc<SessionManager>,
        connectivity: Arc<Connectivity>,
        operator: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            bot,
            settings,
            dispatcher,
            intake,
            sessions,
            connectivity,
            operator,
        }
    }

    /// Polls until the task is dropped. Each update is handled on its own task so a long
    /// report never holds up button presses.
    pub async fn run(self: Arc<Self>) {
        let mut offset = self.skip_backlog().await;
        tracing::info!(offset, "Telegram polling started");

        loop {
            let updates = self
                .bot
                .get_updates()
                .offset(offset)
                .timeout(self.settings.long_poll_secs)
                .await
                .map_err(BotError::from);

            match updates {
                Ok(updates) => {
                    if self.connectivity.mark_restored() {
                        let this = self.clone();
                        tokio::spawn(async move { this.on_restored().await });
                    }
                    for update in updates {
                        offset = update.id + 1;
                        let this = self.clone();
                        tokio::spawn(async move { this.handle(update.kind).await });
                    }
                }
                Err(BotError::NetworkUnreachable(e)) => {
                    if self.connectivity.mark_lost() {
                        tracing::warn!(error = %e, "Network lost");
                    }
                    tokio::time::sleep(OFFLINE_BACKOFF).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Polling failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Updates sent while the bot was down are dropped, not replayed.
    async fn skip_backlog(&self) -> i32 {
        match self.bot.get_updates().offset(-1).timeout(0).await {
            Ok(updates) => updates.last().map(|u| u.id + 1).unwrap_or(0),
            Err(e) => {
                tracing::warn!(error = %e, "Could not skip pending updates");
                0
            }
        }
    }

    #[instrument(skip(self))]
    async fn on_restored(&self) {
        tracing::info!("Network restored, restarting sessions");
        if let Err(e) = self.sessions.restart().await {
            tracing::error!(error = %e, "Session restart after reconnect failed");
        }
        let text = format!(
            "🌐 인터넷 복구 → 자동 재연결!\n\n{}",
            session_summary(&self.sessions)
        );
        if let Err(e) = self.operator.send(&text).await {
            tracing::error!(error = %e, "Failed to announce reconnect");
        }
    }

    async fn handle(&self, kind: UpdateKind) {
        let result = match kind {
            UpdateKind::Message(message) => self.on_message(message).await,
            UpdateKind::CallbackQuery(query) => self.on_callback(query).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "Update handling failed");
        }
    }

    async fn on_message(&self, message: Message) -> Result<()> {
        let Some(text) = message.text() else {
            return Ok(());
        };
        let chat_id = message.chat.id;
        let Some(scope) = scope_of(chat_id.0, &self.settings) else {
            tracing::debug!(chat_id = chat_id.0, "Message from unknown chat ignored");
            return Ok(());
        };
        let Some(kind) = commands::parse(text, scope) else {
            return Ok(());
        };

        tracing::info!(chat_id = chat_id.0, command = ?kind, "Command received");
        let reply = TelegramNotifier::new(self.bot.clone(), chat_id.0);
        if let Err(e) = self.dispatcher.dispatch(kind, &reply).await {
            tracing::error!(error = %e, "Command failed");
            reply
                .send(&format!(
                    "❌ 오류: {}",
                    teloxide::utils::html::escape(&e.to_string())
                ))
                .await?;
        }
        Ok(())
    }

    async fn on_callback(&self, query: CallbackQuery) -> Result<()> {
        let from_operator = query
            .message
            .as_ref()
            .map(|m| m.chat.id.0 == self.settings.chat_id)
            .unwrap_or(false);
        let callback = query
            .data
            .as_deref()
            .filter(|_| from_operator)
            .and_then(parse_callback);

        let Some(callback) = callback else {
            self.bot.answer_callback_query(query.id).await?;
            return Ok(());
        };

        match callback {
            Callback::Approve(order_id) => {
                let answer = if self.intake.is_pending(&order_id) {
                    "처리 중..."
                } else {
                    "주문을 찾을 수 없습니다."
                };
                self.bot.answer_callback_query(query.id).text(answer).await?;
                let outcome = self.intake.approve(&order_id).await?;
                tracing::info!(order_id = %order_id, outcome = ?outcome, "Approval handled");
            }
            Callback::Reject(order_id) => {
                self.bot
                    .answer_callback_query(query.id)
                    .text("나중에 처리")
                    .await?;
                self.intake.reject(&order_id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TelegramSettings {
        TelegramSettings {
            chat_id: 100,
            group_chat_id: Some(-200),
            ..TelegramSettings::default()
        }
    }

    #[test]
    fn callbacks_carry_the_order_id() {
        assert_eq!(
            parse_callback("approve_2025030112345678"),
            Some(Callback::Approve("2025030112345678".to_string()))
        );
        assert_eq!(
            parse_callback("reject_42"),
            Some(Callback::Reject("42".to_string()))
        );
        assert_eq!(parse_callback("approve_"), None);
        assert_eq!(parse_callback("something"), None);
    }

    #[test]
    fn chats_are_scoped() {
        let settings = settings();
        assert_eq!(scope_of(100, &settings), Some(Scope::Personal));
        assert_eq!(scope_of(-200, &settings), Some(Scope::Group));
        assert_eq!(scope_of(7, &settings), None);
    }

    #[test]
    fn connectivity_reports_transitions_once() {
        let c = Connectivity::default();
        assert!(c.is_online());
        assert!(!c.mark_restored());
        assert!(c.mark_lost());
        assert!(!c.mark_lost());
        assert!(!c.is_online());
        assert!(c.mark_restored());
        assert!(c.is_online());
    }
}
