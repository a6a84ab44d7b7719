//! WebDriver plumbing: driver process, client construction and small page helpers.

use fantoccini::elements::Element;
use fantoccini::{Client, ClientBuilder, Locator};
use rand::Rng;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::instrument;

use crate::config::BrowserSettings;
use crate::error::{BotError, Result};

/// WebDriver key codes.
pub const KEY_ESCAPE: &str = "\u{e00c}";
pub const KEY_ENTER: &str = "\u{e007}";

const READY_TIMEOUT: Duration = Duration::from_secs(15);
const READY_POLL: Duration = Duration::from_millis(500);

/// Locally spawned chromedriver; killed when dropped.
#[derive(Debug)]
pub struct DriverProcess {
    child: Child,
}

impl DriverProcess {
    pub fn spawn(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| BotError::Config("browser.driver_command is empty".into()))?;
        let child = Command::new(program)
            .args(parts)
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!(command = %command_line, pid = ?child.id(), "Spawned webdriver");
        Ok(Self { child })
    }

    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to stop webdriver");
        }
    }
}

/// Polls the driver's `/status` endpoint until it reports ready.
#[instrument]
pub async fn wait_until_ready(webdriver_url: &str) -> Result<()> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let status_url = format!("{}/status", webdriver_url.trim_end_matches('/'));
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;

    loop {
        match http.get(&status_url).send().await {
            Ok(response) if response.status().is_success() => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                if body["value"]["ready"].as_bool().unwrap_or(true) {
                    return Ok(());
                }
            }
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Webdriver not ready");
            }
            Err(e) => tracing::debug!(error = %e, "Webdriver unreachable"),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(BotError::NetworkUnreachable(format!(
                "webdriver at {webdriver_url} did not become ready"
            )));
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

pub fn chrome_capabilities(headless: bool) -> Map<String, Value> {
    let mut args = vec![
        "--no-sandbox",
        "--disable-dev-shm-usage",
        "--window-size=1400,900",
        "--lang=ko-KR",
    ];
    if headless {
        args.push("--headless=new");
    }

    let mut caps = Map::new();
    caps.insert("browserName".to_string(), json!("chrome"));
    caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));
    caps
}

/// New browser session with its own profile, so cookie jars never mix.
#[instrument(skip(settings), fields(url = %settings.webdriver_url))]
pub async fn connect(settings: &BrowserSettings, headless: bool) -> Result<Client> {
    wait_until_ready(&settings.webdriver_url).await?;
    let client = ClientBuilder::native()
        .capabilities(chrome_capabilities(headless))
        .connect(&settings.webdriver_url)
        .await?;
    tracing::info!("Webdriver session created");
    Ok(client)
}

pub async fn goto(client: &Client, url: &str, timeout: Duration) -> Result<()> {
    tokio::time::timeout(timeout, client.goto(url))
        .await
        .map_err(|_| BotError::Timeout(format!("navigating to {url}")))??;
    Ok(())
}

/// Sleeps for `base` plus up to half a second of jitter.
pub async fn settle(base: Duration) {
    let jitter = rand::rng().random_range(0..=500u64);
    tokio::time::sleep(base + Duration::from_millis(jitter)).await;
}

pub async fn body_text(client: &Client) -> Result<String> {
    let body = client.find(Locator::Css("body")).await?;
    Ok(body.text().await?)
}

/// Cheap liveness check: fails when the window or driver is gone.
pub async fn is_alive(client: &Client) -> bool {
    client.execute("return true;", vec![]).await.is_ok()
}

/// XPath string literal for arbitrary text.
pub fn xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        format!("'{text}'")
    } else if !text.contains('"') {
        format!("\"{text}\"")
    } else {
        let parts = text
            .split('\'')
            .map(|part| format!("'{part}'"))
            .collect::<Vec<_>>()
            .join(", \"'\", ");
        format!("concat({parts})")
    }
}

/// Innermost elements whose own text contains `text`.
pub fn text_xpath(text: &str) -> String {
    format!("//*[contains(text(), {})]", xpath_literal(text))
}

/// Waits up to `within` for an element containing `text` and clicks it.
pub async fn click_text(client: &Client, text: &str, within: Duration) -> Result<()> {
    let xpath = text_xpath(text);
    let element = client
        .wait()
        .at_most(within)
        .for_element(Locator::XPath(&xpath))
        .await
        .map_err(|_| BotError::ElementNotFound(format!("text '{text}'")))?;
    element.click().await?;
    Ok(())
}

/// Clicks when present; absence is not an error.
pub async fn try_click(client: &Client, locator: Locator<'_>, within: Duration) -> bool {
    match client.wait().at_most(within).for_element(locator).await {
        Ok(element) => element.click().await.is_ok(),
        Err(_) => false,
    }
}

pub async fn try_click_text(client: &Client, text: &str, within: Duration) -> bool {
    let xpath = text_xpath(text);
    try_click(client, Locator::XPath(&xpath), within).await
}

/// Switches into the first iframe whose `src` contains `fragment`.
pub async fn enter_frame(client: &Client, fragment: &str) -> Result<()> {
    client.enter_frame(None).await?;
    for frame in client.find_all(Locator::Css("iframe")).await? {
        let src = frame.attr("src").await?.unwrap_or_default();
        if src.contains(fragment) {
            frame.enter_frame().await?;
            return Ok(());
        }
    }
    Err(BotError::ElementNotFound(format!("iframe {fragment}")))
}

/// Page source of a frame, leaving the client at the top-level document.
pub async fn frame_source(client: &Client, fragment: &str) -> Result<String> {
    enter_frame(client, fragment).await?;
    let source = client.source().await;
    client.enter_frame(None).await?;
    Ok(source?)
}

/// Sends a key to whatever currently has focus.
pub async fn press_key(client: &Client, key: &str) -> Result<()> {
    client.active_element().await?.send_keys(key).await?;
    Ok(())
}

/// Replaces a form field's value and fires `input` so page scripts see the change.
pub async fn set_value(client: &Client, element: &Element, value: &str) -> Result<()> {
    let target = serde_json::to_value(element)?;
    client
        .execute(
            "arguments[0].value = arguments[1];\
             arguments[0].dispatchEvent(new Event('input', { bubbles: true }));",
            vec![target, json!(value)],
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xpath_literal_handles_quotes() {
        assert_eq!(xpath_literal("3개월"), "'3개월'");
        assert_eq!(xpath_literal("it's"), "\"it's\"");
        assert_eq!(
            xpath_literal(r#"a'b"c"#),
            r#"concat('a', "'", 'b"c')"#
        );
    }

    #[test]
    fn capabilities_toggle_headless() {
        let caps = chrome_capabilities(true);
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));

        let caps = chrome_capabilities(false);
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(!args.iter().any(|a| a == "--headless=new"));
    }
}
