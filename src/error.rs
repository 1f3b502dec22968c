use thiserror::Error;

/// Engine-level error taxonomy. Whether an error aborts the run or only drops
/// a single item is decided at the call site: navigation and readiness
/// failures on the initial listing load are fatal, the same failures during a
/// per-item detail visit are not.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or malformed configuration. Raised before any network call.
    #[error("config error: {0}")]
    Config(String),

    /// Transport, DNS, or timeout failure while reaching a page.
    #[error("navigation failed for {url}: {reason}")]
    Navigation { url: String, reason: String },

    /// The page loaded but the expected content never appeared or never
    /// stopped changing within the deadline.
    #[error("page never stabilized for {site}: {detail}")]
    ReadinessTimeout { site: String, detail: String },

    /// The profile's extraction procedure itself failed, e.g. a selector
    /// assumption broke or the in-page script threw.
    #[error("extraction failed for {site}: {reason}")]
    Extraction { site: String, reason: String },

    /// The sink rejected the batch or was unreachable. Extraction work is
    /// already complete at this point and is not rolled back.
    #[error("sink write failed: {0}")]
    Write(String),
}

impl EngineError {
    pub fn navigation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Navigation {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn extraction(site: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Extraction {
            site: site.into(),
            reason: reason.into(),
        }
    }
}
