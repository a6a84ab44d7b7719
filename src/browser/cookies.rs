//! On-disk cookie snapshots for a vendor session.
//!
//! WebDriver only reports and accepts the cookies of the document on screen. Capturing therefore
//! also visits any extra origins (the SMS console's federated identity provider), and restoring
//! visits each cookie origin in turn. Origins a capture could not read are carried over from the
//! previous snapshot, so the identity provider's cookies survive every re-save. They are what
//! makes unattended re-login possible.

use chrono::{DateTime, Utc};
use cookie::time::OffsetDateTime;
use cookie::SameSite;
use fantoccini::cookies::Cookie;
use fantoccini::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use super::driver;
use super::session::LoginProof;
use crate::error::{BotError, Result};
use crate::model::Site;
use crate::store::atomic_write_json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// Unix seconds; `None` for session cookies.
    #[serde(default)]
    pub expires: Option<i64>,
    /// `Strict`, `Lax` or `None`.
    #[serde(default)]
    pub same_site: Option<String>,
}

impl StoredCookie {
    fn from_cookie(cookie: &Cookie<'_>) -> Self {
        Self {
            name: cookie.name().to_string(),
            value: cookie.value().to_string(),
            domain: cookie.domain().map(str::to_string),
            path: cookie.path().map(str::to_string),
            secure: cookie.secure().unwrap_or(false),
            http_only: cookie.http_only().unwrap_or(false),
            expires: cookie.expires_datetime().map(|at| at.unix_timestamp()),
            same_site: cookie.same_site().map(|policy| policy.to_string()),
        }
    }

    /// Persistent cookies keep their expiry; without it the browser would drop them at exit.
    fn to_cookie(&self) -> Cookie<'static> {
        let mut builder = Cookie::build(self.name.clone(), self.value.clone())
            .path(self.path.clone().unwrap_or_else(|| "/".to_string()))
            .secure(self.secure)
            .http_only(self.http_only);
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        if let Some(at) = self.expires.and_then(|at| OffsetDateTime::from_unix_timestamp(at).ok()) {
            builder = builder.expires(at);
        }
        if let Some(policy) = self.same_site.as_deref().and_then(parse_same_site) {
            builder = builder.same_site(policy);
        }
        builder.finish()
    }

    /// Cookies with the same name, domain and path overwrite each other in the browser.
    fn key(&self) -> (&str, Option<&str>, Option<&str>) {
        (&self.name, self.domain.as_deref(), self.path.as_deref())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires, Some(at) if at <= now.timestamp())
    }

    /// Origin the browser must be on for WebDriver to accept this cookie.
    pub fn origin(&self) -> Option<String> {
        let domain = self.domain.as_deref()?.trim_start_matches('.');
        if domain.is_empty() {
            return None;
        }
        Some(format!("https://{domain}/"))
    }
}

fn parse_same_site(policy: &str) -> Option<SameSite> {
    match policy.to_ascii_lowercase().as_str() {
        "strict" => Some(SameSite::Strict),
        "lax" => Some(SameSite::Lax),
        "none" => Some(SameSite::None),
        _ => None,
    }
}

async fn read_cookies(client: &Client) -> Result<Vec<StoredCookie>> {
    Ok(client
        .get_all_cookies()
        .await?
        .iter()
        .map(StoredCookie::from_cookie)
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub site: Site,
    pub saved_at: DateTime<Utc>,
    pub cookies: Vec<StoredCookie>,
}

impl SessionSnapshot {
    /// Reads the cookies of the page on screen, then those of each extra origin, and returns
    /// the browser to where it started. An origin that cannot be read is logged and skipped.
    pub async fn capture(
        client: &Client,
        site: Site,
        extra_origins: &[String],
        nav_timeout: Duration,
    ) -> Result<Self> {
        let mut cookies = read_cookies(client).await?;
        if !extra_origins.is_empty() {
            let home = client.current_url().await?;
            for origin in extra_origins {
                let read = match driver::goto(client, origin, nav_timeout).await {
                    Ok(()) => read_cookies(client).await,
                    Err(e) => Err(e),
                };
                match read {
                    Ok(found) => {
                        tracing::debug!(origin = %origin, cookies = found.len(), "Captured cookies");
                        cookies.extend(found);
                    }
                    Err(e) => {
                        tracing::warn!(origin = %origin, error = %e, "Could not read cookie origin")
                    }
                }
            }
            driver::goto(client, home.as_str(), nav_timeout).await?;
        }
        Ok(Self::from_cookies(site, cookies))
    }

    /// Snapshot of `cookies` taken now. The last copy of a repeated cookie wins.
    pub fn from_cookies(site: Site, cookies: Vec<StoredCookie>) -> Self {
        let mut unique: Vec<StoredCookie> = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            match unique.iter_mut().find(|c| c.key() == cookie.key()) {
                Some(existing) => *existing = cookie,
                None => unique.push(cookie),
            }
        }
        Self {
            site,
            saved_at: Utc::now(),
            cookies: unique,
        }
    }

    /// Carries over live cookies from `previous` whose origin this snapshot has none of.
    pub fn keep_missing_origins(&mut self, previous: &SessionSnapshot, now: DateTime<Utc>) {
        let seen: BTreeSet<String> = self.cookies.iter().filter_map(StoredCookie::origin).collect();
        let carried: Vec<StoredCookie> = previous
            .cookies
            .iter()
            .filter(|c| !c.is_expired(now))
            .filter(|c| c.origin().map_or(false, |origin| !seen.contains(&origin)))
            .cloned()
            .collect();
        if !carried.is_empty() {
            tracing::debug!(site = %self.site, carried = carried.len(), "Kept cookies of origins not captured");
            self.cookies.extend(carried);
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Only a verified login may overwrite the snapshot on disk.
    pub fn save(&self, path: &Path, proof: &LoginProof) -> Result<()> {
        if proof.site() != self.site {
            return Err(BotError::Unknown(format!(
                "login proof for {} cannot save a {} snapshot",
                proof.site(),
                self.site
            )));
        }
        atomic_write_json(path, self)?;
        tracing::info!(
            site = %self.site,
            cookies = self.cookies.len(),
            verified_at = %proof.verified_at(),
            "Saved session snapshot"
        );
        Ok(())
    }

    /// Live cookies grouped by the origin they must be injected from.
    pub fn by_origin(&self, now: DateTime<Utc>) -> BTreeMap<String, Vec<&StoredCookie>> {
        let mut grouped: BTreeMap<String, Vec<&StoredCookie>> = BTreeMap::new();
        for cookie in self.cookies.iter().filter(|c| !c.is_expired(now)) {
            if let Some(origin) = cookie.origin() {
                grouped.entry(origin).or_default().push(cookie);
            }
        }
        grouped
    }

    /// Injects the snapshot into a fresh session. Returns how many cookies were accepted.
    pub async fn restore(&self, client: &Client, nav_timeout: Duration) -> Result<usize> {
        let mut restored = 0;
        for (origin, cookies) in self.by_origin(Utc::now()) {
            if let Err(e) = driver::goto(client, &origin, nav_timeout).await {
                tracing::warn!(origin = %origin, error = %e, "Skipping cookie origin");
                continue;
            }
            for cookie in cookies {
                match client.add_cookie(cookie.to_cookie()).await {
                    Ok(()) => restored += 1,
                    Err(e) => tracing::debug!(
                        origin = %origin,
                        name = %cookie.name,
                        error = %e,
                        "Cookie rejected"
                    ),
                }
            }
        }
        tracing::info!(site = %self.site, restored, "Restored session cookies");
        Ok(restored)
    }
}
