//! Lifecycle of the two authenticated vendor sessions.
//!
//! Each [`Site`] owns one WebDriver session behind its own async mutex. Callers take the lock
//! with a bounded wait and get [`BotError::Busy`] when it stays held; nothing ever drives a
//! session without holding its lock. State changes go through [`SessionManager::set_state`],
//! which also mirrors them into a lock-free snapshot for status queries.

use chrono::{DateTime, Utc};
use fantoccini::{Client, Locator};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;
use url::Url;

use super::cookies::SessionSnapshot;
use super::driver::{self, DriverProcess};
use crate::config::AppSettings;
use crate::error::{BotError, Recovery, Result};
use crate::model::Site;
use crate::notify::{ExpiryAlertGate, Notifier};

const STOREFRONT_VERIFY_ATTEMPTS: usize = 3;
const FEDERATED_REDIRECT_POLLS: usize = 30;
const FEDERATED_REDIRECT_INTERVAL: Duration = Duration::from_secs(1);
const INTERACTIVE_POLL: Duration = Duration::from_secs(5);

/// Evidence that a session was just seen logged in. Required to persist its cookies.
#[derive(Debug, Clone)]
pub struct LoginProof {
    site: Site,
    verified_at: DateTime<Utc>,
}

impl LoginProof {
    pub(super) fn new(site: Site) -> Self {
        Self {
            site,
            verified_at: Utc::now(),
        }
    }

    pub fn site(&self) -> Site {
        self.site
    }

    pub fn verified_at(&self) -> DateTime<Utc> {
        self.verified_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Absent,
    LoggedIn {
        verified_at: DateTime<Utc>,
    },
    LoggedOut,
    Failed(String),
}

impl SessionState {
    pub fn is_logged_in(&self) -> bool {
        matches!(self, SessionState::LoggedIn { .. })
    }

    pub fn label(&self) -> String {
        match self {
            SessionState::Absent => "⚪ 미연결".to_string(),
            SessionState::LoggedIn { verified_at } => format!(
                "✅ 로그인됨 ({} 확인)",
                verified_at
                    .with_timezone(&crate::report::kst())
                    .format("%H:%M")
            ),
            SessionState::LoggedOut => "❌ 세션 만료".to_string(),
            SessionState::Failed(reason) => {
                format!("⚠️ 오류: {}", teloxide::utils::html::escape(reason))
            }
        }
    }
}

/// Storefront dashboard shows at least one seller-menu marker once logged in.
pub fn storefront_logged_in(page_text: &str, markers: &[String]) -> bool {
    markers.iter().any(|marker| page_text.contains(marker.as_str()))
}

pub fn sms_login_form_visible(page_text: &str, has_password_input: bool) -> bool {
    page_text.contains("아이디 저장") || page_text.contains("비밀번호 재설정") || has_password_input
}

/// Logged in means no login form and some logout affordance.
pub fn sms_logged_in(page_text: &str, has_password_input: bool, has_logout_element: bool) -> bool {
    if sms_login_form_visible(page_text, has_password_input) {
        return false;
    }
    page_text.contains("로그아웃") || has_logout_element
}

/// The composer is usable: no login form and the SMS controls rendered.
pub fn sms_send_page_ready(page_text: &str) -> bool {
    !sms_login_form_visible(page_text, false)
        && (page_text.contains("내 문자함") || page_text.contains("메시지 입력"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// Still on the identity provider.
    Pending,
    Returned,
    Failed,
}

/// Where a federated login stands, judged from the current URL.
pub fn redirect_outcome(url: &Url, home_host: &str) -> RedirectOutcome {
    if !url.host_str().unwrap_or_default().contains(home_host) {
        return RedirectOutcome::Pending;
    }
    if url.as_str().contains("loginFail") {
        RedirectOutcome::Failed
    } else {
        RedirectOutcome::Returned
    }
}

/// One vendor's browser session.
#[derive(Debug)]
pub struct SiteSession {
    site: Site,
    client: Option<Client>,
    state: SessionState,
}

impl SiteSession {
    fn new(site: Site) -> Self {
        Self {
            site,
            client: None,
            state: SessionState::Absent,
        }
    }

    pub fn site(&self) -> Site {
        self.site
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| BotError::Browser(format!("{} session is not open", self.site)))
    }
}

/// Exclusive access to one site's session for the duration of an operation.
pub struct SessionGuard<'a> {
    manager: &'a SessionManager,
    session: MutexGuard<'a, SiteSession>,
}

impl SessionGuard<'_> {
    pub fn site(&self) -> Site {
        self.session.site
    }

    pub fn client(&self) -> Result<&Client> {
        self.session.client()
    }

    pub fn settings(&self) -> &AppSettings {
        &self.manager.settings
    }

    /// Unattended federated re-login while already holding the lock.
    pub async fn relogin(&mut self) -> Result<()> {
        self.manager.relogin_locked(&mut self.session).await
    }

    /// Closes a session an operation found logged out, alerts the operator (rate limited)
    /// and returns the error to surface.
    pub async fn expired(&mut self) -> BotError {
        self.manager.expire(&mut self.session).await
    }

    /// Runs `op` under a wall-clock limit, tearing the session down when the failure calls
    /// for a fresh one.
    pub async fn run<T, F, Fut>(&mut self, label: &str, limit: Duration, op: F) -> Result<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = self.client()?.clone();
        let result = bounded(label, limit, op(client)).await;
        if let Err(e) = &result {
            self.manager.settle_failure(&mut self.session, label, e).await;
        }
        result
    }
}

/// Awaits `op` for at most `limit`; running over becomes [`BotError::Timeout`].
async fn bounded<T>(
    label: &str,
    limit: Duration,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(BotError::Timeout(format!(
            "{label} exceeded {}s",
            limit.as_secs()
        ))),
    }
}

pub struct SessionManager {
    settings: Arc<AppSettings>,
    notifier: Arc<dyn Notifier>,
    alerts: ExpiryAlertGate,
    driver: Mutex<Option<DriverProcess>>,
    storefront: Mutex<SiteSession>,
    sms: Mutex<SiteSession>,
    states: std::sync::Mutex<BTreeMap<Site, SessionState>>,
}

impl SessionManager {
    pub fn new(settings: Arc<AppSettings>, notifier: Arc<dyn Notifier>) -> Self {
        let alerts = ExpiryAlertGate::new(settings.browser.alert_cooldown());
        Self {
            settings,
            notifier,
            alerts,
            driver: Mutex::new(None),
            storefront: Mutex::new(SiteSession::new(Site::Storefront)),
            sms: Mutex::new(SiteSession::new(Site::Sms)),
            states: std::sync::Mutex::new(
                Site::ALL
                    .iter()
                    .map(|site| (*site, SessionState::Absent))
                    .collect(),
            ),
        }
    }

    fn slot(&self, site: Site) -> &Mutex<SiteSession> {
        match site {
            Site::Storefront => &self.storefront,
            Site::Sms => &self.sms,
        }
    }

    async fn lock(&self, site: Site) -> Result<MutexGuard<'_, SiteSession>> {
        let wait = self.settings.browser.lock_timeout();
        tokio::time::timeout(wait, self.slot(site).lock())
            .await
            .map_err(|_| {
                tracing::warn!(site = %site, wait = ?wait, "Session lock wait timed out");
                BotError::Busy(format!("{site} 세션 사용 중"))
            })
    }

    /// Locked, verified storefront session.
    pub async fn storefront(&self) -> Result<SessionGuard<'_>> {
        self.guard(Site::Storefront).await
    }

    /// Locked, verified SMS console session.
    pub async fn sms(&self) -> Result<SessionGuard<'_>> {
        self.guard(Site::Sms).await
    }

    async fn guard(&self, site: Site) -> Result<SessionGuard<'_>> {
        let mut session = self.lock(site).await?;
        self.ensure_locked(&mut session).await?;
        Ok(SessionGuard {
            manager: self,
            session,
        })
    }

    /// Verifies both sessions, recovering what can be recovered. Idempotent.
    #[instrument(skip(self))]
    pub async fn ensure(&self) -> Result<()> {
        let mut first_error = None;
        for site in Site::ALL {
            let outcome = match self.lock(site).await {
                Ok(mut session) => self.ensure_locked(&mut session).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                tracing::warn!(site = %site, error = %e, "Session not ready");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Makes the locked session usable: replaces a dead browser, opens one from the saved
    /// cookies when none is open, then verifies the login. SMS gets one federated re-login
    /// when found logged out.
    ///
    /// When verification cannot reach the site, the session is closed, marked failed and the
    /// error returned. It is not re-created here; the next `ensure` or guard request opens a
    /// fresh browser.
    async fn ensure_locked(&self, session: &mut SiteSession) -> Result<()> {
        let site = session.site;

        let lost = match &session.client {
            Some(client) => !driver::is_alive(client).await,
            None => false,
        };
        if lost {
            tracing::warn!(site = %site, "Browser session lost, recreating");
            self.close(session).await;
        }

        if session.client.is_none() {
            if let Err(e) = self.open(session).await {
                self.set_state(session, SessionState::Failed(e.to_string()));
                if e.is_session_expired() {
                    self.alert_expired(site).await;
                }
                return Err(e);
            }
        }

        let verified = match self.verify(session).await {
            Ok(verified) => verified,
            Err(e) => {
                self.close(session).await;
                self.set_state(session, SessionState::Failed(e.to_string()));
                return Err(e);
            }
        };

        if let Some(proof) = verified {
            return self.record_login(session, proof).await;
        }

        tracing::warn!(site = %site, "Session logged out");
        let recovered = match site {
            Site::Sms => self.relogin_locked(session).await,
            Site::Storefront => Err(BotError::session_expired(site)),
        };
        if let Err(e) = recovered {
            self.close(session).await;
            self.set_state(session, SessionState::LoggedOut);
            self.alert_expired(site).await;
            return Err(e);
        }
        Ok(())
    }

    /// Spawns the WebDriver process when one is configured and not yet running.
    pub async fn ensure_driver(&self) -> Result<()> {
        let Some(command) = &self.settings.browser.driver_command else {
            return Ok(());
        };
        let mut driver = self.driver.lock().await;
        if driver.is_none() {
            *driver = Some(DriverProcess::spawn(command)?);
        }
        Ok(())
    }

    /// New browser with the site's saved cookies injected.
    #[instrument(skip(self, session), fields(site = %session.site))]
    async fn open(&self, session: &mut SiteSession) -> Result<()> {
        let site = session.site;
        let path = self.settings.data_path(site.snapshot_file());
        let Some(snapshot) = SessionSnapshot::load(&path)? else {
            tracing::error!(path = %path.display(), "No saved session; run setup first");
            return Err(BotError::session_expired(site));
        };

        self.ensure_driver().await?;
        let client = driver::connect(&self.settings.browser, self.settings.browser.headless).await?;
        let nav = Duration::from_secs(self.settings.browser.navigation_timeout_secs);
        if let Err(e) = snapshot.restore(&client, nav).await {
            let _ = client.close().await;
            return Err(e);
        }
        session.client = Some(client);
        Ok(())
    }

    async fn close(&self, session: &mut SiteSession) {
        if let Some(client) = session.client.take() {
            if let Err(e) = client.close().await {
                tracing::debug!(site = %session.site, error = %e, "Closing browser session failed");
            }
            tracing::info!(site = %session.site, "Browser session closed");
        }
        if session.state.is_logged_in() {
            self.set_state(session, SessionState::Absent);
        }
    }

    fn nav_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.browser.navigation_timeout_secs)
    }

    /// Navigates to the site's home and checks the login heuristic.
    #[instrument(skip(self, session), fields(site = %session.site))]
    async fn verify(&self, session: &SiteSession) -> Result<Option<LoginProof>> {
        let client = session.client()?;
        match session.site {
            Site::Storefront => self.verify_storefront(client).await,
            Site::Sms => {
                driver::goto(client, &self.settings.sms.main_url, self.nav_timeout()).await?;
                driver::settle(Duration::from_secs(3)).await;
                Ok(self
                    .shows_login(Site::Sms, client)
                    .await?
                    .then(|| LoginProof::new(Site::Sms)))
            }
        }
    }

    async fn verify_storefront(&self, client: &Client) -> Result<Option<LoginProof>> {
        let url = &self.settings.storefront.dashboard_url;
        let mut last_error = None;

        for attempt in 1..=STOREFRONT_VERIFY_ATTEMPTS {
            match driver::goto(client, url, self.nav_timeout()).await {
                Ok(()) => {
                    for _ in 0..2 {
                        driver::settle(Duration::from_secs(3)).await;
                        if self.shows_login(Site::Storefront, client).await? {
                            return Ok(Some(LoginProof::new(Site::Storefront)));
                        }
                    }
                    tracing::warn!(attempt, "Storefront login markers not found");
                    last_error = None;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Storefront dashboard unreachable");
                    last_error = Some(e);
                    if attempt < STOREFRONT_VERIFY_ATTEMPTS {
                        driver::settle(Duration::from_secs(5)).await;
                    }
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Checks the page currently loaded, without navigating.
    async fn shows_login(&self, site: Site, client: &Client) -> Result<bool> {
        let text = driver::body_text(client).await?;
        Ok(match site {
            Site::Storefront => {
                storefront_logged_in(&text, &self.settings.storefront.login_markers)
            }
            Site::Sms => {
                let has_password = client
                    .find(Locator::Css(".login_box input[type=\"password\"]"))
                    .await
                    .is_ok();
                let has_logout = client
                    .find(Locator::Css(".logout, [class*=\"logout\"]"))
                    .await
                    .is_ok();
                sms_logged_in(&text, has_password, has_logout)
            }
        })
    }

    fn identity_origins(&self, site: Site) -> &[String] {
        match site {
            Site::Sms => self.settings.sms.identity_origins.as_slice(),
            Site::Storefront => &[],
        }
    }

    /// Captures the session's cookies and writes them over the saved snapshot. Origins the
    /// capture could not read keep their previously saved cookies.
    async fn save_snapshot(&self, client: &Client, site: Site, proof: &LoginProof) -> Result<()> {
        let path = self.settings.data_path(site.snapshot_file());
        let mut snapshot =
            SessionSnapshot::capture(client, site, self.identity_origins(site), self.nav_timeout())
                .await?;
        match SessionSnapshot::load(&path) {
            Ok(Some(previous)) => snapshot.keep_missing_origins(&previous, Utc::now()),
            Ok(None) => {}
            Err(e) => tracing::warn!(site = %site, error = %e, "Previous snapshot unreadable"),
        }
        snapshot.save(&path, proof)
    }

    async fn record_login(&self, session: &mut SiteSession, proof: LoginProof) -> Result<()> {
        let client = session.client()?;
        self.save_snapshot(client, session.site, &proof).await?;
        self.set_state(
            session,
            SessionState::LoggedIn {
                verified_at: proof.verified_at(),
            },
        );
        Ok(())
    }

    /// Public entry for the `ppuriologin` command.
    #[instrument(skip(self))]
    pub async fn relogin_sms(&self) -> Result<()> {
        let mut session = self.lock(Site::Sms).await?;
        let result = self.relogin_locked(&mut session).await;
        if result.is_err() {
            self.close(&mut session).await;
            self.set_state(&mut session, SessionState::LoggedOut);
        }
        result
    }

    /// Fresh browser from the saved cookies, then the federated login button.
    async fn relogin_locked(&self, session: &mut SiteSession) -> Result<()> {
        let site = session.site;
        tracing::info!(site = %site, "Attempting federated re-login");

        self.close(session).await;
        self.open(session).await?;
        let client = session.client()?.clone();
        let sms = &self.settings.sms;

        driver::goto(&client, &sms.main_url, self.nav_timeout()).await?;
        driver::settle(Duration::from_secs(2)).await;
        if self.shows_login(site, &client).await? {
            tracing::info!(site = %site, "Saved cookies still valid");
            return self.record_login(session, LoginProof::new(site)).await;
        }

        if !driver::try_click(
            &client,
            Locator::Css(&sms.federated_button),
            Duration::from_secs(5),
        )
        .await
        {
            return Err(BotError::ElementNotFound(format!(
                "federated login button {}",
                sms.federated_button
            )));
        }

        let mut outcome = RedirectOutcome::Pending;
        for _ in 0..FEDERATED_REDIRECT_POLLS {
            tokio::time::sleep(FEDERATED_REDIRECT_INTERVAL).await;
            if let Ok(url) = client.current_url().await {
                outcome = redirect_outcome(&url, &sms.host);
                if outcome != RedirectOutcome::Pending {
                    break;
                }
            }
        }
        match outcome {
            RedirectOutcome::Pending => {
                tracing::warn!(site = %site, "Identity provider did not redirect back; its cookies expired");
                return Err(BotError::session_expired(site));
            }
            RedirectOutcome::Failed => {
                tracing::warn!(site = %site, "Federated login reported loginFail");
                return Err(BotError::session_expired(site));
            }
            RedirectOutcome::Returned => {}
        }

        driver::settle(Duration::from_secs(2)).await;
        driver::goto(&client, &sms.main_url, self.nav_timeout()).await?;
        driver::settle(Duration::from_secs(3)).await;
        if self.shows_login(site, &client).await? {
            tracing::info!(site = %site, "Federated re-login succeeded");
            self.record_login(session, LoginProof::new(site)).await
        } else {
            Err(BotError::session_expired(site))
        }
    }

    /// Refreshes idle sessions so the vendors do not expire them. Busy sessions are skipped.
    #[instrument(skip(self))]
    pub async fn keep_alive(&self) -> Result<()> {
        for site in Site::ALL {
            let Ok(mut session) = self.slot(site).try_lock() else {
                tracing::debug!(site = %site, "Session busy, skipping keep-alive");
                continue;
            };
            if session.client.is_none() {
                continue;
            }
            if let Err(e) = self.keep_alive_locked(&mut session).await {
                tracing::warn!(site = %site, error = %e, "Keep-alive failed");
                match e.recovery() {
                    Recovery::RetryNextCycle => {}
                    Recovery::RecreateSession => {
                        self.close(&mut session).await;
                        self.set_state(&mut session, SessionState::Failed(e.to_string()));
                    }
                    Recovery::NotifyOperator => {
                        self.close(&mut session).await;
                        self.set_state(&mut session, SessionState::LoggedOut);
                        if e.is_session_expired() {
                            self.alert_expired(site).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn keep_alive_locked(&self, session: &mut SiteSession) -> Result<()> {
        let site = session.site;
        let client = session.client()?.clone();
        let ready = match site {
            Site::Storefront => {
                driver::goto(&client, &self.settings.storefront.dashboard_url, self.nav_timeout())
                    .await?;
                driver::settle(Duration::from_secs(3)).await;
                self.shows_login(site, &client).await?
            }
            Site::Sms => {
                driver::goto(&client, &self.settings.sms.send_url, self.nav_timeout()).await?;
                driver::settle(Duration::from_secs(3)).await;
                sms_send_page_ready(&driver::body_text(&client).await?)
            }
        };

        if ready {
            tracing::info!(site = %site, "Keep-alive ok");
            return self.record_login(session, LoginProof::new(site)).await;
        }
        match site {
            Site::Sms => self.relogin_locked(session).await,
            Site::Storefront => Err(BotError::session_expired(site)),
        }
    }

    /// Closes one site's browser. Waits for the lock like any other operation.
    pub async fn teardown(&self, site: Site) -> Result<()> {
        let mut session = self.lock(site).await?;
        self.close(&mut session).await;
        self.set_state(&mut session, SessionState::Absent);
        Ok(())
    }

    /// Tears both sessions down and brings them back up.
    #[instrument(skip(self))]
    pub async fn restart(&self) -> Result<()> {
        for site in Site::ALL {
            self.teardown(site).await?;
        }
        self.ensure().await
    }

    /// Releases every browser and the driver process.
    pub async fn shutdown(&self) {
        for site in Site::ALL {
            if let Err(e) = self.teardown(site).await {
                tracing::warn!(site = %site, error = %e, "Could not release session on shutdown");
            }
        }
        if let Some(driver) = self.driver.lock().await.take() {
            driver.stop().await;
        }
    }

    /// Last known state of each session; never waits on a session lock.
    pub fn status(&self) -> BTreeMap<Site, SessionState> {
        match self.states.lock() {
            Ok(states) => states.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, session: &mut SiteSession, state: SessionState) {
        if session.state != state {
            tracing::info!(site = %session.site, from = ?session.state, to = ?state, "Session state change");
        }
        session.state = state.clone();
        let mut states = match self.states.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        states.insert(session.site, state);
    }

    /// Applies the recovery a failed operation calls for.
    async fn settle_failure(&self, session: &mut SiteSession, label: &str, e: &BotError) {
        let site = session.site;
        match e.recovery() {
            Recovery::RetryNextCycle => {
                tracing::warn!(site = %site, op = label, error = %e, "Operation failed, retrying next cycle");
            }
            Recovery::RecreateSession | Recovery::NotifyOperator => {
                tracing::warn!(site = %site, op = label, error = %e, "Operation failed, recreating session");
                if e.is_session_expired() {
                    self.expire(session).await;
                } else {
                    self.close(session).await;
                    self.set_state(session, SessionState::Failed(e.to_string()));
                }
            }
        }
    }

    async fn expire(&self, session: &mut SiteSession) -> BotError {
        let site = session.site;
        self.close(session).await;
        self.set_state(session, SessionState::LoggedOut);
        self.alert_expired(site).await;
        BotError::session_expired(site)
    }

    /// Session-expiry alert, rate limited per site.
    pub async fn alert_expired(&self, site: Site) {
        if !self.alerts.should_alert(site, Instant::now()) {
            tracing::debug!(site = %site, "Expiry alert suppressed by cooldown");
            return;
        }
        let text = expiry_alert_text(site);
        if let Err(e) = self.notifier.send(&text).await {
            tracing::error!(site = %site, error = %e, "Failed to send expiry alert");
        }
    }

    /// Opens a visible browser and waits for the operator to log in by hand.
    #[instrument(skip(self))]
    pub async fn interactive_login(&self, site: Site, wait: Duration) -> Result<()> {
        self.ensure_driver().await?;
        let client = driver::connect(&self.settings.browser, false).await?;
        let start_url = match site {
            Site::Storefront => &self.settings.storefront.dashboard_url,
            Site::Sms => &self.settings.sms.main_url,
        };
        driver::goto(&client, start_url, self.nav_timeout()).await?;
        tracing::info!(site = %site, "Log in within the opened browser window");

        let deadline = Instant::now() + wait;
        let result = loop {
            if self.shows_login(site, &client).await.unwrap_or(false) {
                let proof = LoginProof::new(site);
                break self.save_snapshot(&client, site, &proof).await;
            }
            if Instant::now() >= deadline {
                break Err(BotError::Timeout(format!("{site} interactive login")));
            }
            tokio::time::sleep(INTERACTIVE_POLL).await;
        };

        let _ = client.close().await;
        result
    }
}

pub fn expiry_alert_text(site: Site) -> String {
    match site {
        Site::Sms => "⚠️ <b>뿌리오 세션 만료</b>\n\n자동 재로그인 실패. 터미널에서 실행:\n\
             <code>ticket-order-bot setup sms</code>\n그 후 <code>봇재시작</code> 입력"
            .to_string(),
        Site::Storefront => "⚠️ <b>스마트스토어 세션 만료</b>\n\n터미널에서 실행:\n\
             <code>ticket-order-bot setup storefront</code>\n그 후 <code>봇재시작</code> 입력"
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::fake::RecordingNotifier;

    fn manager() -> (Arc<RecordingNotifier>, SessionManager) {
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = SessionManager::new(Arc::new(AppSettings::default()), notifier.clone());
        (notifier, manager)
    }

    fn logged_in(manager: &SessionManager, site: Site) -> SiteSession {
        let mut session = SiteSession::new(site);
        manager.set_state(
            &mut session,
            SessionState::LoggedIn {
                verified_at: Utc::now(),
            },
        );
        session
    }

    #[tokio::test]
    async fn expiry_alert_is_sent_once_per_cooldown() {
        let (notifier, manager) = manager();
        manager.alert_expired(Site::Sms).await;
        manager.alert_expired(Site::Sms).await;
        assert_eq!(notifier.texts(), vec![expiry_alert_text(Site::Sms)]);

        manager.alert_expired(Site::Storefront).await;
        assert_eq!(notifier.texts().len(), 2);
        assert_eq!(notifier.texts()[1], expiry_alert_text(Site::Storefront));
    }

    #[tokio::test]
    async fn overrunning_operation_fails_the_session() {
        let (notifier, manager) = manager();
        let mut session = logged_in(&manager, Site::Storefront);

        let result: Result<()> = bounded("new order scrape", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let e = result.unwrap_err();
        assert!(matches!(e, BotError::Timeout(_)));
        assert_eq!(e.recovery(), Recovery::RecreateSession);

        manager.settle_failure(&mut session, "new order scrape", &e).await;
        assert!(session.client.is_none());
        assert!(matches!(session.state(), SessionState::Failed(_)));
        assert_eq!(manager.status()[&Site::Storefront], *session.state());
        assert!(notifier.texts().is_empty());
    }

    #[tokio::test]
    async fn fast_operation_passes_through() {
        let value = bounded("cancel scrape", Duration::from_secs(5), async { Ok(7) }).await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn failure_recovery_by_error() {
        let (notifier, manager) = manager();

        let mut busy = logged_in(&manager, Site::Storefront);
        manager
            .settle_failure(&mut busy, "store sales search", &BotError::Busy("x".into()))
            .await;
        assert!(busy.state().is_logged_in());

        let mut sms = logged_in(&manager, Site::Sms);
        let expired = BotError::session_expired(Site::Sms);
        manager.settle_failure(&mut sms, "sms send", &expired).await;
        manager.settle_failure(&mut sms, "sms send", &expired).await;
        assert_eq!(*sms.state(), SessionState::LoggedOut);
        assert_eq!(notifier.texts(), vec![expiry_alert_text(Site::Sms)]);
    }

    fn markers() -> Vec<String> {
        crate::config::StorefrontSettings::default().login_markers
    }

    #[test]
    fn storefront_markers_detect_login() {
        assert!(storefront_logged_in("홈 판매관리 정산관리", &markers()));
        assert!(!storefront_logged_in("네이버 로그인 아이디 비밀번호", &markers()));
    }

    #[test]
    fn sms_login_form_wins_over_logout_text() {
        assert!(!sms_logged_in("아이디 저장 로그아웃", false, true));
        assert!(!sms_logged_in("메인", true, true));
        assert!(sms_logged_in("홍길동님 로그아웃", false, false));
        assert!(sms_logged_in("메인", false, true));
        assert!(!sms_logged_in("메인", false, false));
    }

    #[test]
    fn send_page_needs_composer_controls() {
        assert!(sms_send_page_ready("내 문자함 | 메시지 입력"));
        assert!(!sms_send_page_ready("비밀번호 재설정 내 문자함"));
        assert!(!sms_send_page_ready("빈 화면"));
    }

    #[test]
    fn redirect_outcome_tracks_host_and_failure() {
        let pending = Url::parse("https://nid.naver.com/oauth2.0/authorize").unwrap();
        let back = Url::parse("https://www.ppurio.com/main").unwrap();
        let failed = Url::parse("https://www.ppurio.com/login?loginFail=true").unwrap();

        assert_eq!(redirect_outcome(&pending, "ppurio.com"), RedirectOutcome::Pending);
        assert_eq!(redirect_outcome(&back, "ppurio.com"), RedirectOutcome::Returned);
        assert_eq!(redirect_outcome(&failed, "ppurio.com"), RedirectOutcome::Failed);
    }

    #[test]
    fn state_labels() {
        assert_eq!(SessionState::LoggedOut.label(), "❌ 세션 만료");
        assert!(SessionState::LoggedIn {
            verified_at: Utc::now()
        }
        .is_logged_in());
        assert!(expiry_alert_text(Site::Sms).contains("뿌리오 세션 만료"));
    }
}
