use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::dedup::{ExistingIndex, filter_new};
use crate::error::EngineError;
use crate::extract::{Record, UNTITLED_PLACEHOLDER, build_record, split_value};
use crate::profile::{DetailVisit, SiteProfile};
use crate::report::FailureReporter;
use crate::session::PageSession;
use crate::sink::Sink;

/// Terminal accounting for one run, for log- or exit-code-based monitoring.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub site: String,
    /// Records written (or, on a write failure, ready to write).
    pub admitted: usize,
    /// Candidates dropped because their identity was already known, either
    /// from the sink or from earlier in this same run.
    pub skipped_duplicates: usize,
    /// Items dropped over a failed detail visit.
    pub item_failures: usize,
    /// Known rows whose value column was refreshed (sheet refresh mode).
    pub refreshed: usize,
    /// Final tracked element count reported by the scroll loop.
    pub tracked_count: usize,
}

/// Drive one full run: open session → ready-wait → scroll → extract →
/// normalize → dedup → detail visits → write → close. Stages are strictly
/// sequential; a fatal failure reports through `reporter` and aborts, while
/// per-item failures only drop that item.
pub async fn execute<S: PageSession>(
    profile: &SiteProfile,
    mut session: S,
    sink: &Sink,
    reporter: &FailureReporter,
) -> Result<RunOutcome, EngineError> {
    let site = profile.site.as_str();
    let mut outcome = RunOutcome {
        site: site.to_string(),
        ..RunOutcome::default()
    };

    // url validity is checked at profile load.
    let base = Url::parse(&profile.url)
        .map_err(|e| EngineError::Config(format!("{site}: bad url: {e}")))?;
    let timeout = Duration::from_millis(profile.timeout_ms);

    // Snapshot the existing identity keys once, before touching the site.
    // The snapshot is never refreshed mid-run; concurrent writers are the
    // sink's idempotent-upsert problem, not ours.
    let existing = match sink.existing_keys().await {
        Ok(keys) => ExistingIndex::from_keys(keys),
        Err(e) => {
            reporter.report_fatal(site, &e, None).await;
            session.close().await;
            return Err(e);
        }
    };
    debug!(site, known = existing.len(), "existing index loaded");

    if let Err(e) = session.open(&profile.url, timeout).await {
        let html = session.page_source().await;
        reporter.report_fatal(site, &e, html.as_deref()).await;
        session.close().await;
        return Err(e);
    }

    if let Err(e) = session.await_ready(&profile.ready, timeout).await {
        let html = session.page_source().await;
        reporter.report_fatal(site, &e, html.as_deref()).await;
        session.close().await;
        return Err(e);
    }

    if let Some(policy) = &profile.scroll {
        // Scroll trouble is not worth aborting over; extract whatever the
        // page showed so far.
        match session.scroll_until_stable(policy).await {
            Ok(count) => {
                outcome.tracked_count = count;
                debug!(site, count, "scroll settled");
            }
            Err(e) => warn!(site, error = %e, "scroll loop failed, extracting current state"),
        }
    }

    let raw_items = match session.extract(&profile.extract).await {
        Ok(items) => items,
        Err(e) => {
            let html = session.page_source().await;
            reporter.report_fatal(site, &e, html.as_deref()).await;
            session.close().await;
            return Err(e);
        }
    };
    debug!(site, raw = raw_items.len(), "extraction finished");

    let mut candidates = Vec::with_capacity(raw_items.len());
    for raw in &raw_items {
        match build_record(raw, &base) {
            Some(record) => candidates.push(record),
            None => debug!(site, "dropped raw item with no usable identity"),
        }
    }

    let candidate_count = candidates.len();
    let deduped = filter_new(candidates, &existing);
    outcome.skipped_duplicates = candidate_count - deduped.admitted.len();

    let mut admitted = deduped.admitted;
    if let Some(rules) = &profile.detail {
        admitted = enrich_from_details(&mut session, site, rules, admitted, &mut outcome).await;
    }
    outcome.admitted = admitted.len();

    let write_result = if admitted.is_empty() {
        debug!(site, "nothing new to write");
        Ok(())
    } else {
        sink.write(&admitted).await.map(|report| {
            debug!(site, written = report.written, "batch written");
        })
    };

    if sink.refresh_enabled() && !deduped.known.is_empty() {
        match sink.refresh(&deduped.known).await {
            Ok(n) => outcome.refreshed = n,
            Err(e) => warn!(site, error = %e, "value refresh failed"),
        }
    }

    session.close().await;

    if let Err(e) = write_result {
        // Extraction work is done and is not rolled back; the next run's
        // index read will simply still miss these records and retry them.
        info!(
            site,
            admitted = outcome.admitted,
            skipped = outcome.skipped_duplicates,
            item_failures = outcome.item_failures,
            "run extracted records but the sink write failed"
        );
        reporter.report_fatal(site, &e, None).await;
        return Err(e);
    }

    info!(
        site,
        admitted = outcome.admitted,
        skipped = outcome.skipped_duplicates,
        item_failures = outcome.item_failures,
        refreshed = outcome.refreshed,
        "run complete"
    );
    Ok(outcome)
}

/// Visit detail pages for admitted records still missing a title or value.
/// A failed visit drops that one item and the run continues; one broken item
/// must not forfeit the rest of the batch.
async fn enrich_from_details<S: PageSession>(
    session: &mut S,
    site: &str,
    rules: &DetailVisit,
    admitted: Vec<Record>,
    outcome: &mut RunOutcome,
) -> Vec<Record> {
    let mut kept = Vec::with_capacity(admitted.len());
    for mut record in admitted {
        let wants_title = rules.title.is_some() && record.title == UNTITLED_PLACEHOLDER;
        let wants_value = rules.value.is_some() && record.value.is_none();
        if record.detail_url.is_empty() || (!wants_title && !wants_value) {
            kept.push(record);
            continue;
        }

        match session.navigate_detail(rules, &record.detail_url).await {
            Ok(found) => {
                if wants_title {
                    if let Some(title) = found.get("title") {
                        record.title = title.clone();
                    }
                }
                if wants_value {
                    if let Some(text) = found.get("value") {
                        let (value, unit) = split_value(text);
                        record.value = value;
                        if record.unit.is_none() {
                            record.unit = unit;
                        }
                    }
                }
                kept.push(record);
            }
            Err(e) => {
                warn!(site, url = %record.detail_url, error = %e, "detail visit failed, item skipped");
                outcome.item_failures += 1;
            }
        }
    }
    kept
}
