use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::EngineError;

/// Declarative per-site configuration. Selectors, wait heuristics, scroll
/// behavior and the sink binding all live here as data; the engine never
/// hardcodes a site's markup.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteProfile {
    /// Short slug, used for the REST `source_slug` field, artifact file names
    /// and log lines.
    pub site: String,
    /// Listing page to load.
    pub url: String,
    #[serde(default)]
    pub render: RenderMode,
    pub ready: ReadyCheck,
    pub extract: ExtractSpec,
    #[serde(default)]
    pub scroll: Option<ScrollPolicy>,
    /// Optional per-item detail-page visit to recover fields the listing
    /// doesn't carry.
    #[serde(default)]
    pub detail: Option<DetailVisit>,
    pub sink: SinkBinding,
    /// Deadline for the initial load and the readiness wait.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Load through a WebDriver browser session (client-side rendered sites).
    #[default]
    Browser,
    /// Plain HTTP GET; good enough for server-rendered listings.
    Fetch,
}

/// Readiness predicate over the rendered page. `Stable` exists because a
/// single-shot existence check races with paginated/virtualized rendering:
/// the count must also hold across two consecutive polls.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadyCheck {
    Exists {
        selector: String,
        #[serde(default = "default_min_count")]
        min_count: usize,
    },
    Stable {
        selector: String,
        #[serde(default = "default_min_count")]
        min_count: usize,
    },
}

fn default_min_count() -> usize {
    1
}

/// Profile-supplied extraction procedure. The engine never interprets DOM
/// structure itself; it either runs the profile's script in the page or
/// applies the profile's CSS field map to the document.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractSpec {
    /// JS snippet executed in the page, must return an array of flat objects.
    /// Browser sessions only.
    Script { script: String },
    /// One selector for the repeating item element plus per-field rules
    /// resolved inside each item.
    Selectors {
        item: String,
        fields: BTreeMap<String, FieldRule>,
    },
}

/// How to pull one field out of an item element. No selector means the item
/// element itself; no attr means its text content.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldRule {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub attr: Option<String>,
}

/// Scroll/"load more" loop parameters. The loop is always bounded by
/// `max_iterations` regardless of page behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrollPolicy {
    /// Selector whose match count is tracked to decide the page settled.
    pub track: String,
    /// Optional "load more" control clicked between scroll steps.
    #[serde(default)]
    pub load_more: Option<String>,
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_pause_ms() -> u64 {
    700
}

fn default_max_iterations() -> usize {
    12
}

/// Fields to recover from an item's detail page when the listing left them
/// blank. A timed-out detail visit drops that one item, never the run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetailVisit {
    #[serde(default)]
    pub title: Option<FieldRule>,
    #[serde(default)]
    pub value: Option<FieldRule>,
    #[serde(default = "default_detail_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_detail_timeout_ms() -> u64 {
    15_000
}

/// Where admitted records go.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkBinding {
    /// Append-only CSV sheet; `refresh_values` additionally rewrites the
    /// trailing value column of rows whose identity is already known.
    Sheet {
        path: String,
        #[serde(default)]
        refresh_values: bool,
    },
    /// Batch upsert endpoint; the endpoint owns server-side idempotency keyed
    /// on the same identity the engine dedups on.
    Rest {
        endpoint: String,
        /// Read-only listing of known identity keys; defaults to `endpoint`.
        #[serde(default)]
        index_endpoint: Option<String>,
    },
}

impl SiteProfile {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("read {}: {e}", path.display())))?;
        let profile: SiteProfile = serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("parse {}: {e}", path.display())))?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.site.trim().is_empty() {
            return Err(EngineError::Config("profile has empty site slug".into()));
        }
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| EngineError::Config(format!("{}: bad url {}: {e}", self.site, self.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::Config(format!(
                "{}: url must be http(s), got {}",
                self.site, self.url
            )));
        }
        if let (RenderMode::Fetch, ExtractSpec::Script { .. }) = (self.render, &self.extract) {
            return Err(EngineError::Config(format!(
                "{}: script extraction requires render = browser",
                self.site
            )));
        }
        Ok(())
    }

    /// Load every `*.json` profile in a directory, sorted by file name so runs
    /// are ordered deterministically.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>, EngineError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| EngineError::Config(format!("read dir {}: {e}", dir.display())))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| EngineError::Config(format!("read dir {}: {e}", dir.display())))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();
        paths.iter().map(|p| Self::load(p)).collect()
    }
}
