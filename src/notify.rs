//! Outbound operator notifications over Telegram.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};

use crate::config::TelegramSettings;
use crate::error::Result;
use crate::model::Site;

/// Telegram rejects messages longer than 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;

/// An inline button: visible label plus the callback payload it sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub label: String,
    pub data: String,
}

impl Action {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// HTML-formatted message to the operator.
    async fn send(&self, text: &str) -> Result<()>;

    /// Message with one row of inline buttons.
    async fn send_with_actions(&self, text: &str, actions: &[Action]) -> Result<()>;
}

/// Builds a bot whose HTTP client outlives the long poll.
pub fn build_bot(settings: &TelegramSettings) -> Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(settings.client_timeout())
        .build()?;
    Ok(Bot::with_client(settings.token.clone(), client))
}

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, chat_id: i64) -> Self {
        Self {
            bot,
            chat_id: ChatId(chat_id),
        }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    /// Answers in whichever chat the command came from, splitting long reports.
    pub async fn reply(&self, chat_id: ChatId, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            self.bot
                .send_message(chat_id, chunk)
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        self.reply(self.chat_id, text).await
    }

    async fn send_with_actions(&self, text: &str, actions: &[Action]) -> Result<()> {
        let row = actions
            .iter()
            .map(|a| InlineKeyboardButton::callback(a.label.clone(), a.data.clone()))
            .collect::<Vec<_>>();
        self.bot
            .send_message(self.chat_id, text)
            .parse_mode(ParseMode::Html)
            .reply_markup(InlineKeyboardMarkup::new(vec![row]))
            .await?;
        Ok(())
    }
}

/// Splits on line boundaries so no chunk exceeds `limit` characters.
/// A single line longer than the limit is cut on character boundaries.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let needed = if current.is_empty() { line_len } else { line_len + 1 };

        if current_len + needed > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > limit {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                current = piece.iter().collect();
                current_len = piece.len();
            }
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Rate limit for "session expired" alerts: one per site per cooldown window.
#[derive(Debug)]
pub struct ExpiryAlertGate {
    cooldown: Duration,
    last_sent: Mutex<HashMap<Site, Instant>>,
}

impl ExpiryAlertGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Records the alert when it is allowed.
    pub fn should_alert(&self, site: Site, now: Instant) -> bool {
        let mut last_sent = match self.last_sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match last_sent.get(&site) {
            Some(sent) if now.saturating_duration_since(*sent) < self.cooldown => false,
            _ => {
                last_sent.insert(site, now);
                true
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    /// Captures every message instead of sending it.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<(String, Vec<Action>)>>,
    }

    impl RecordingNotifier {
        pub fn texts(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .map(|(text, _)| text.clone())
                .collect()
        }

        pub fn actions(&self) -> Vec<Action> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, actions)| actions.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, text: &str) -> Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((text.to_string(), Vec::new()));
            Ok(())
        }

        async fn send_with_actions(&self, text: &str, actions: &[Action]) -> Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((text.to_string(), actions.to_vec()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_gate_allows_one_alert_per_window() {
        let gate = ExpiryAlertGate::new(Duration::from_secs(30 * 60));
        let start = Instant::now();

        assert!(gate.should_alert(Site::Sms, start));
        assert!(!gate.should_alert(Site::Sms, start + Duration::from_secs(60)));
        assert!(!gate.should_alert(Site::Sms, start + Duration::from_secs(29 * 60)));
        assert!(gate.should_alert(Site::Storefront, start + Duration::from_secs(60)));
        assert!(gate.should_alert(Site::Sms, start + Duration::from_secs(30 * 60)));
    }

    #[test]
    fn split_message_respects_limit() {
        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(split_message(text, 9), vec!["aaaa\nbbbb", "cccc"]);
        assert_eq!(split_message(text, 100), vec![text]);
        assert_eq!(split_message("", 10), vec![""]);
    }

    #[test]
    fn split_message_cuts_overlong_lines() {
        let chunks = split_message("abcdefgh\nxy", 3);
        assert_eq!(chunks, vec!["abc", "def", "gh", "xy"]);
    }
}
