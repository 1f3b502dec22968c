use std::time::{Duration, Instant};

use clap::ValueEnum;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::extract::{RawItem, count_matches, extract_field, extract_items};
use crate::profile::{DetailVisit, ExtractSpec, ReadyCheck, ScrollPolicy};

const USER_AGENT: &str = concat!("oripa-watch/", env!("CARGO_PKG_VERSION"));
const READY_POLL: Duration = Duration::from_millis(300);
const DETAIL_SETTLE: Duration = Duration::from_millis(400);

/// One rendered view of a site for the lifetime of a run. Implemented by the
/// WebDriver-backed `BrowserSession`, the plain-HTTP `FetchSession`, and the
/// in-memory fakes the end-to-end tests drive the orchestrator with.
pub trait PageSession {
    /// Load the listing URL. A failure here is fatal to the run.
    async fn open(&mut self, url: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Poll the profile's readiness predicate until it holds or the deadline
    /// passes.
    async fn await_ready(&mut self, check: &ReadyCheck, timeout: Duration)
    -> Result<(), EngineError>;

    /// Scroll/"load more" until the tracked count stops increasing for two
    /// consecutive iterations or the iteration bound is hit. Returns the
    /// final count for diagnostics.
    async fn scroll_until_stable(&mut self, policy: &ScrollPolicy) -> Result<usize, EngineError>;

    /// Run the profile's extraction procedure against the current DOM.
    async fn extract(&mut self, spec: &ExtractSpec) -> Result<Vec<RawItem>, EngineError>;

    /// Visit one item's detail page to recover fields missing from the
    /// listing, then restore the listing view. A failure here drops the item,
    /// never the run.
    async fn navigate_detail(
        &mut self,
        rules: &DetailVisit,
        url: &str,
    ) -> Result<RawItem, EngineError>;

    /// Current rendered markup, for the failure artifact. Best effort.
    async fn page_source(&mut self) -> Option<String>;

    async fn close(self);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum BrowserKind {
    Chrome,
    Firefox,
}

/// Tracks the item count across scroll passes. Settles once two consecutive
/// observations fail to grow the count.
pub(crate) struct ScrollTracker {
    count: usize,
    stale: usize,
}

impl ScrollTracker {
    pub(crate) fn new(initial: usize) -> Self {
        Self { count: initial, stale: 0 }
    }

    pub(crate) fn observe(&mut self, next: usize) -> bool {
        if next > self.count {
            self.count = next;
            self.stale = 0;
        } else {
            self.stale += 1;
        }
        self.stale >= 2
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }
}

/// WebDriver-backed session. Speaks the wire protocol directly over reqwest
/// (session create, navigate, execute-sync, back, delete); the driver process
/// itself is managed outside the engine.
pub struct BrowserSession {
    client: reqwest::Client,
    base: String,
    session_id: String,
    site: String,
    listing_url: Option<String>,
}

impl BrowserSession {
    pub async fn connect(
        endpoint: &str,
        browser: BrowserKind,
        headless: bool,
        site: &str,
    ) -> Result<Self, EngineError> {
        let client = http_client()
            .map_err(|e| EngineError::Config(format!("webdriver client build failed: {e}")))?;
        let base = endpoint.trim_end_matches('/').to_string();
        let caps = capabilities(browser, headless);

        let body = wd_call(client.post(format!("{base}/session")).json(&caps))
            .await
            .map_err(|e| EngineError::navigation(endpoint, format!("session create: {e}")))?;
        let session_id = body
            .pointer("/value/sessionId")
            .and_then(|v| v.as_str())
            .or_else(|| body.pointer("/sessionId").and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .ok_or_else(|| {
                EngineError::navigation(endpoint, "session create returned no sessionId")
            })?;
        debug!(site, session_id, "webdriver session created");

        Ok(Self {
            client,
            base,
            session_id,
            site: site.to_string(),
            listing_url: None,
        })
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), EngineError> {
        let nav = format!("{}/session/{}/url", self.base, self.session_id);
        let call = wd_call(self.client.post(nav).json(&json!({ "url": url })));
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(EngineError::navigation(url, e)),
            Err(_) => Err(EngineError::navigation(
                url,
                format!("timed out after {}ms", timeout.as_millis()),
            )),
        }
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, String> {
        let exec = format!("{}/session/{}/execute/sync", self.base, self.session_id);
        let body = wd_call(
            self.client
                .post(exec)
                .json(&json!({ "script": script, "args": args })),
        )
        .await?;
        Ok(body.pointer("/value").cloned().unwrap_or(Value::Null))
    }

    async fn count(&self, selector: &str) -> Result<usize, String> {
        let value = self
            .execute(
                "return document.querySelectorAll(arguments[0]).length;",
                vec![json!(selector)],
            )
            .await?;
        value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| format!("selector count returned non-number: {value}"))
    }

    async fn source(&self) -> Result<String, String> {
        let value = self
            .execute(
                "return document.documentElement ? document.documentElement.outerHTML : '';",
                Vec::new(),
            )
            .await?;
        value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| "page source returned non-string".to_string())
    }

    /// Restore the listing view after a detail visit: history back first, a
    /// fresh navigation to the listing URL if that fails.
    async fn restore_listing(&self) -> Result<(), EngineError> {
        let back = format!("{}/session/{}/back", self.base, self.session_id);
        let result = wd_call(self.client.post(back).json(&json!({}))).await;
        if result.is_ok() {
            return Ok(());
        }
        let Some(listing) = self.listing_url.clone() else {
            return Err(EngineError::navigation(
                "about:blank",
                "no listing url to restore",
            ));
        };
        self.navigate(&listing, Duration::from_secs(20)).await
    }
}

impl PageSession for BrowserSession {
    async fn open(&mut self, url: &str, timeout: Duration) -> Result<(), EngineError> {
        self.navigate(url, timeout).await?;
        self.listing_url = Some(url.to_string());
        Ok(())
    }

    async fn await_ready(
        &mut self,
        check: &ReadyCheck,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let (selector, min_count, needs_stability) = match check {
            ReadyCheck::Exists {
                selector,
                min_count,
            } => (selector.as_str(), *min_count, false),
            ReadyCheck::Stable {
                selector,
                min_count,
            } => (selector.as_str(), *min_count, true),
        };

        let deadline = Instant::now() + timeout;
        let mut prev: Option<usize> = None;
        loop {
            let probed = self.count(selector).await;
            match &probed {
                Ok(count) if *count >= min_count && (!needs_stability || prev == Some(*count)) => {
                    return Ok(());
                }
                Ok(count) => prev = Some(*count),
                Err(e) => {
                    // A mid-render execute hiccup is a not-yet-ready poll,
                    // not a verdict; the deadline decides.
                    debug!(site = %self.site, "readiness probe failed, retrying: {e}");
                    prev = None;
                }
            }
            if Instant::now() + READY_POLL >= deadline {
                let detail = match probed {
                    Ok(count) => format!(
                        "{selector}: count {count} (want >= {min_count}{}) after {}ms",
                        if needs_stability { ", stable" } else { "" },
                        timeout.as_millis()
                    ),
                    Err(e) => format!("readiness probe failed: {e}"),
                };
                return Err(EngineError::ReadinessTimeout {
                    site: self.site.clone(),
                    detail,
                });
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn scroll_until_stable(&mut self, policy: &ScrollPolicy) -> Result<usize, EngineError> {
        let site = self.site.clone();
        let initial = self
            .count(&policy.track)
            .await
            .map_err(|e| EngineError::extraction(&site, format!("scroll probe: {e}")))?;
        let mut tracker = ScrollTracker::new(initial);

        for iteration in 0..policy.max_iterations {
            self.execute("window.scrollTo(0, document.body.scrollHeight);", Vec::new())
                .await
                .map_err(|e| EngineError::extraction(&site, format!("scroll step: {e}")))?;
            if let Some(button) = &policy.load_more {
                self.execute(
                    "var el = document.querySelector(arguments[0]); if (el) el.click();",
                    vec![json!(button)],
                )
                .await
                .map_err(|e| EngineError::extraction(&site, format!("load-more click: {e}")))?;
            }
            tokio::time::sleep(Duration::from_millis(policy.pause_ms)).await;

            let next = self
                .count(&policy.track)
                .await
                .map_err(|e| EngineError::extraction(&site, format!("scroll probe: {e}")))?;
            let settled = tracker.observe(next);
            debug!(site, iteration, count = tracker.count(), settled, "scroll step");
            if settled {
                break;
            }
        }
        Ok(tracker.count())
    }

    async fn extract(&mut self, spec: &ExtractSpec) -> Result<Vec<RawItem>, EngineError> {
        match spec {
            ExtractSpec::Script { script } => {
                let value = self
                    .execute(script, Vec::new())
                    .await
                    .map_err(|e| EngineError::extraction(&self.site, e))?;
                raw_items_from_value(&value)
                    .map_err(|e| EngineError::extraction(&self.site, e))
            }
            ExtractSpec::Selectors { item, fields } => {
                let html = self
                    .source()
                    .await
                    .map_err(|e| EngineError::extraction(&self.site, e))?;
                extract_items(&html, item, fields)
                    .map_err(|e| EngineError::extraction(&self.site, e))
            }
        }
    }

    async fn navigate_detail(
        &mut self,
        rules: &DetailVisit,
        url: &str,
    ) -> Result<RawItem, EngineError> {
        self.navigate(url, Duration::from_millis(rules.timeout_ms))
            .await?;
        tokio::time::sleep(DETAIL_SETTLE).await;

        let html = self
            .source()
            .await
            .map_err(|e| EngineError::extraction(&self.site, e));
        let restore = self.restore_listing().await;

        let html = html?;
        if let Err(e) = restore {
            warn!(site = %self.site, error = %e, "listing restore after detail visit failed");
        }

        let mut item = RawItem::new();
        if let Some(rule) = &rules.title {
            if let Some(text) = extract_field(&html, rule) {
                item.insert("title".to_string(), text);
            }
        }
        if let Some(rule) = &rules.value {
            if let Some(text) = extract_field(&html, rule) {
                item.insert("value".to_string(), text);
            }
        }
        Ok(item)
    }

    async fn page_source(&mut self) -> Option<String> {
        self.source().await.ok()
    }

    async fn close(self) {
        let delete = format!("{}/session/{}", self.base, self.session_id);
        if let Err(e) = self.client.delete(delete).send().await {
            debug!(site = %self.site, "session delete failed: {e}");
        }
    }
}

/// Plain HTTP session for server-rendered listings: one GET, selectors
/// evaluated over the fetched document, scrolling a no-op.
pub struct FetchSession {
    client: reqwest::Client,
    site: String,
    html: Option<String>,
}

impl FetchSession {
    pub fn new(site: &str) -> Result<Self, EngineError> {
        let client = http_client()
            .map_err(|e| EngineError::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            site: site.to_string(),
            html: None,
        })
    }

    async fn fetch(&self, url: &str, timeout: Duration) -> Result<String, EngineError> {
        let request = self.client.get(url).send();
        let response = match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(EngineError::navigation(url, e.to_string())),
            Err(_) => {
                return Err(EngineError::navigation(
                    url,
                    format!("timed out after {}ms", timeout.as_millis()),
                ));
            }
        };
        if !response.status().is_success() {
            return Err(EngineError::navigation(
                url,
                format!("http {}", response.status().as_u16()),
            ));
        }
        response
            .text()
            .await
            .map_err(|e| EngineError::navigation(url, format!("body read: {e}")))
    }

    fn current(&self) -> Result<&str, EngineError> {
        self.html
            .as_deref()
            .ok_or_else(|| EngineError::extraction(&self.site, "no page loaded"))
    }
}

impl PageSession for FetchSession {
    async fn open(&mut self, url: &str, timeout: Duration) -> Result<(), EngineError> {
        let html = self.fetch(url, timeout).await?;
        self.html = Some(html);
        Ok(())
    }

    async fn await_ready(
        &mut self,
        check: &ReadyCheck,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        // The document is static once fetched, so polling cannot change the
        // answer: a single count decides.
        let (selector, min_count) = match check {
            ReadyCheck::Exists {
                selector,
                min_count,
            }
            | ReadyCheck::Stable {
                selector,
                min_count,
            } => (selector.as_str(), *min_count),
        };
        let count = count_matches(self.current()?, selector).map_err(|e| {
            EngineError::ReadinessTimeout {
                site: self.site.clone(),
                detail: format!("readiness probe failed: {e}"),
            }
        })?;
        if count >= min_count {
            Ok(())
        } else {
            Err(EngineError::ReadinessTimeout {
                site: self.site.clone(),
                detail: format!("{selector}: count {count} (want >= {min_count}) in fetched document"),
            })
        }
    }

    async fn scroll_until_stable(&mut self, policy: &ScrollPolicy) -> Result<usize, EngineError> {
        count_matches(self.current()?, &policy.track)
            .map_err(|e| EngineError::extraction(&self.site, format!("scroll probe: {e}")))
    }

    async fn extract(&mut self, spec: &ExtractSpec) -> Result<Vec<RawItem>, EngineError> {
        match spec {
            ExtractSpec::Script { .. } => Err(EngineError::extraction(
                &self.site,
                "script extraction requires a browser session",
            )),
            ExtractSpec::Selectors { item, fields } => {
                extract_items(self.current()?, item, fields)
                    .map_err(|e| EngineError::extraction(&self.site, e))
            }
        }
    }

    async fn navigate_detail(
        &mut self,
        rules: &DetailVisit,
        url: &str,
    ) -> Result<RawItem, EngineError> {
        // The listing document stays in memory, so there is nothing to
        // restore afterwards.
        let html = self
            .fetch(url, Duration::from_millis(rules.timeout_ms))
            .await?;
        let mut item = RawItem::new();
        if let Some(rule) = &rules.title {
            if let Some(text) = extract_field(&html, rule) {
                item.insert("title".to_string(), text);
            }
        }
        if let Some(rule) = &rules.value {
            if let Some(text) = extract_field(&html, rule) {
                item.insert("value".to_string(), text);
            }
        }
        Ok(item)
    }

    async fn page_source(&mut self) -> Option<String> {
        self.html.clone()
    }

    async fn close(self) {}
}

fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(40))
        .build()
}

/// Issue one WebDriver request and unpack the protocol's error envelope.
async fn wd_call(request: reqwest::RequestBuilder) -> Result<Value, String> {
    let res = request
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|e| format!("response read failed: {e}"))?;
    if !status.is_success() {
        return Err(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_for_log(&body, 240)
        ));
    }
    let value: Value = serde_json::from_str(&body).unwrap_or_default();
    if let Some(err) = value.pointer("/value/error").and_then(|v| v.as_str()) {
        let message = value
            .pointer("/value/message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown webdriver error");
        return Err(format!("{err}: {message}"));
    }
    Ok(value)
}

fn capabilities(browser: BrowserKind, headless: bool) -> Value {
    match browser {
        BrowserKind::Firefox => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("-headless".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "moz:firefoxOptions": { "args": args }
                    }
                }
            })
        }
        BrowserKind::Chrome => {
            let mut args = vec![
                "--disable-gpu".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--no-first-run".to_string(),
                "--window-size=1400,1200".to_string(),
            ];
            if headless {
                args.push("--headless=new".to_string());
            }
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "goog:chromeOptions": { "args": args }
                    }
                }
            })
        }
    }
}

/// Convert the value returned by an in-page extraction script into raw items.
/// The script must return an array of flat objects; scalar members are
/// stringified, nulls skipped.
fn raw_items_from_value(value: &Value) -> Result<Vec<RawItem>, String> {
    let array = value
        .as_array()
        .ok_or_else(|| format!("extraction script returned non-array: {value}"))?;
    let mut out = Vec::with_capacity(array.len());
    for entry in array {
        let Some(object) = entry.as_object() else {
            return Err(format!("extraction script yielded non-object item: {entry}"));
        };
        let mut item = RawItem::new();
        for (key, member) in object {
            let text = match member {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => other.to_string(),
            };
            item.insert(key.clone(), text);
        }
        out.push(item);
    }
    Ok(out)
}

pub(crate) fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_items_stringify_scalars() {
        let value = json!([
            { "title": "Pack A", "value": 1000, "sold": false, "note": null },
            { "url": "/items/2" }
        ]);
        let items = raw_items_from_value(&value).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].get("value").map(String::as_str), Some("1000"));
        assert_eq!(items[0].get("sold").map(String::as_str), Some("false"));
        assert!(!items[0].contains_key("note"));
        assert_eq!(items[1].get("url").map(String::as_str), Some("/items/2"));
    }

    #[test]
    fn script_items_reject_non_array() {
        assert!(raw_items_from_value(&json!({"title": "x"})).is_err());
        assert!(raw_items_from_value(&json!([42])).is_err());
    }

    #[test]
    fn scroll_tracker_settles_after_two_flat_passes() {
        let mut tracker = ScrollTracker::new(4);
        assert!(!tracker.observe(8));
        assert!(!tracker.observe(8));
        assert!(tracker.observe(8));
        assert_eq!(tracker.count(), 8);
    }

    #[test]
    fn scroll_tracker_never_settles_while_growing() {
        let mut tracker = ScrollTracker::new(0);
        for next in 1..=12 {
            assert!(!tracker.observe(next));
        }
        assert_eq!(tracker.count(), 12);
    }

    #[test]
    fn scroll_tracker_ignores_count_regressions() {
        let mut tracker = ScrollTracker::new(10);
        assert!(!tracker.observe(6));
        assert!(tracker.count() == 10);
        assert!(tracker.observe(6));
    }

    #[test]
    fn truncation_keeps_short_strings() {
        assert_eq!(truncate_for_log("short", 240), "short");
        assert_eq!(truncate_for_log(&"x".repeat(300), 4), "xxxx...");
    }
}
