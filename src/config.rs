use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BotError, Result};

/// Environment prefix for overrides, e.g. `TICKETBOT__TELEGRAM__TOKEN`.
const ENV_PREFIX: &str = "TICKETBOT";

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AppSettings {
    pub telegram: TelegramSettings,
    pub storefront: StorefrontSettings,
    pub sms: SmsSettings,
    pub interpark: InterparkSettings,
    pub browser: BrowserSettings,
    pub paths: PathSettings,
    pub schedule: ScheduleSettings,
    /// Keyed by `<region>_<kind>`, e.g. `대구_디즈니`.
    pub performances: BTreeMap<String, Performance>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TelegramSettings {
    pub token: String,
    pub chat_id: i64,
    /// Optional group that may run read-only sales queries.
    pub group_chat_id: Option<i64>,
    pub http_timeout_secs: u64,
    pub long_poll_secs: u32,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StorefrontSettings {
    pub dashboard_url: String,
    pub delivery_url: String,
    pub cancel_url: String,
    pub manage_url: String,
    pub delivery_frame: String,
    pub cancel_frame: String,
    pub manage_frame: String,
    pub new_order_cards: Vec<String>,
    pub login_markers: Vec<String>,
    pub popup_dismiss_text: String,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SmsSettings {
    pub main_url: String,
    pub send_url: String,
    pub host: String,
    pub federated_button: String,
    /// Identity-provider pages whose cookies are saved with the SMS session.
    pub identity_origins: Vec<String>,
    pub template_prefix: String,
    pub regions: Vec<String>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct InterparkSettings {
    pub login_url: String,
    pub sales_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    /// Spawned before connecting when set (e.g. `chromedriver --port=9515`).
    pub driver_command: Option<String>,
    pub headless: bool,
    pub navigation_timeout_secs: u64,
    pub scrape_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    pub alert_cooldown_mins: u64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PathSettings {
    pub data_dir: PathBuf,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ScheduleSettings {
    pub order_check_mins: u64,
    pub keep_alive_mins: u64,
    pub daily_report_hour: u32,
    pub daily_report_minute: u32,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct Performance {
    pub name: String,
    pub date: String,
}

impl AppSettings {
    /// Loads a TOML file (optional) and layers environment overrides on top.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| BotError::Config(e.to_string()))?;

        let settings: AppSettings = settings
            .try_deserialize()
            .map_err(|e| BotError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.token.is_empty() {
            return Err(BotError::Config("telegram.token is not set".into()));
        }
        if self.telegram.chat_id == 0 {
            return Err(BotError::Config("telegram.chat_id is not set".into()));
        }
        Ok(())
    }

    pub fn data_path(&self, file_name: &str) -> PathBuf {
        self.paths.data_dir.join(file_name)
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        let performances = [
            ("대구_디즈니", "대구 디즈니+지브리", "3/15(일)"),
            ("창원_디즈니", "창원 디즈니+지브리", "3/21(토)"),
            ("광주_지브리", "광주 지브리&뮤지컬", "3/28(토)"),
            ("대전_지브리", "대전 지브리&뮤지컬", "3/29(일)"),
            ("부산_지브리", "부산 지브리&뮤지컬", "4/4(토)"),
            ("고양_지브리", "고양 지브리&뮤지컬", "4/19(토)"),
        ]
        .into_iter()
        .map(|(key, name, date)| {
            (
                key.to_string(),
                Performance {
                    name: name.to_string(),
                    date: date.to_string(),
                },
            )
        })
        .collect();

        Self {
            telegram: TelegramSettings::default(),
            storefront: StorefrontSettings::default(),
            sms: SmsSettings::default(),
            interpark: InterparkSettings::default(),
            browser: BrowserSettings::default(),
            paths: PathSettings::default(),
            schedule: ScheduleSettings::default(),
            performances,
        }
    }
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            token: String::new(),
            chat_id: 0,
            group_chat_id: None,
            http_timeout_secs: 60,
            long_poll_secs: 30,
        }
    }
}

impl TelegramSettings {
    /// Client timeout must outlive the long poll itself.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(u64::from(self.long_poll_secs) + 10))
    }
}

impl Default for StorefrontSettings {
    fn default() -> Self {
        Self {
            dashboard_url: "https://sell.smartstore.naver.com/#/home/dashboard".to_string(),
            delivery_url: "https://sell.smartstore.naver.com/#/naverpay/sale/delivery".to_string(),
            cancel_url: "https://sell.smartstore.naver.com/#/naverpay/sale/cancel".to_string(),
            manage_url: "https://sell.smartstore.naver.com/#/naverpay/manage/order".to_string(),
            delivery_frame: "/o/v3/n/sale/delivery".to_string(),
            cancel_frame: "/sale/cancel".to_string(),
            manage_frame: "/o/v3/manage/order".to_string(),
            new_order_cards: vec![
                "신규주문(발주 전)".to_string(),
                "신규주문(발주 후)".to_string(),
            ],
            login_markers: vec![
                "판매관리".to_string(),
                "정산관리".to_string(),
                "주문/배송".to_string(),
                "상품관리".to_string(),
            ],
            popup_dismiss_text: "하루동안 보지 않기".to_string(),
        }
    }
}

impl Default for SmsSettings {
    fn default() -> Self {
        Self {
            main_url: "https://www.ppurio.com/".to_string(),
            send_url: "https://www.ppurio.com/send/sms/gn/view".to_string(),
            host: "ppurio.com".to_string(),
            federated_button: ".btn_naver".to_string(),
            identity_origins: vec!["https://nid.naver.com/".to_string()],
            template_prefix: "[멜론]".to_string(),
            regions: ["대전", "광주", "창원", "울산", "대구", "부산", "서울", "고양"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
        }
    }
}

impl SmsSettings {
    /// Saved-message title for a region, e.g. `[멜론] 대전 공연 예매 완료`.
    pub fn template_title(&self, region: &str) -> String {
        format!("{} {} 공연 예매 완료", self.template_prefix, region)
    }
}

impl Default for InterparkSettings {
    fn default() -> Self {
        Self {
            login_url: "https://tadmin20.interpark.com".to_string(),
            sales_url: "https://tadmin20.interpark.com/stat/dailysalesinfo".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            driver_command: None,
            headless: true,
            navigation_timeout_secs: 60,
            scrape_timeout_secs: 180,
            lock_timeout_secs: 30,
            alert_cooldown_mins: 30,
        }
    }
}

impl BrowserSettings {
    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_mins * 60)
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            order_check_mins: 3,
            keep_alive_mins: 20,
            daily_report_hour: 9,
            daily_report_minute: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_has_production_intervals() {
        let settings = AppSettings::default();
        assert_eq!(settings.schedule.order_check_mins, 3);
        assert_eq!(settings.schedule.keep_alive_mins, 20);
        assert_eq!(settings.browser.alert_cooldown(), Duration::from_secs(30 * 60));
        assert!(settings.performances.contains_key("대구_디즈니"));
    }

    #[test]
    fn client_timeout_outlives_long_poll() {
        let telegram = TelegramSettings {
            http_timeout_secs: 5,
            long_poll_secs: 30,
            ..TelegramSettings::default()
        };
        assert_eq!(telegram.client_timeout(), Duration::from_secs(40));
    }

    #[test]
    fn template_title_uses_prefix() {
        let sms = SmsSettings::default();
        assert_eq!(sms.template_title("대전"), "[멜론] 대전 공연 예매 완료");
    }

    #[test]
    fn from_file_reads_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[telegram]\ntoken = \"abc\"\nchat_id = 42\n\n[schedule]\norder_check_mins = 5"
        )
        .unwrap();

        let settings = AppSettings::from_file(&path).unwrap();
        assert_eq!(settings.telegram.token, "abc");
        assert_eq!(settings.telegram.chat_id, 42);
        assert_eq!(settings.schedule.order_check_mins, 5);
        assert_eq!(settings.schedule.keep_alive_mins, 20);
        assert_eq!(settings.telegram.long_poll_secs, 30);
    }

    #[test]
    fn from_file_rejects_missing_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.toml");
        std::fs::write(&path, "[telegram]\nchat_id = 42\n").unwrap();
        assert!(matches!(
            AppSettings::from_file(&path),
            Err(BotError::Config(_))
        ));
    }
}
