use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oripa_watch::profile::{RenderMode, SiteProfile};
use oripa_watch::report::FailureReporter;
use oripa_watch::run;
use oripa_watch::session::{BrowserKind, BrowserSession, FetchSession};
use oripa_watch::sink::Sink;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "oripa-watch",
    version,
    about = "Watch oripa catalog pages and upsert newly listed items into a sheet or CMS"
)]
struct Cli {
    /// Profile JSON files, or directories of them.
    #[arg(value_name = "PROFILE", required = true)]
    profiles: Vec<PathBuf>,

    /// WebDriver endpoint used by browser-rendered profiles. The driver
    /// process itself is managed outside this tool.
    #[arg(long, value_name = "URL", default_value = "http://localhost:4444")]
    webdriver_url: String,

    #[arg(long, value_enum, default_value_t = BrowserKind::Chrome)]
    browser: BrowserKind,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    headless: bool,

    /// Concurrent runs; each one owns a full browser session, so keep this
    /// within the machine's browser budget.
    #[arg(long, value_name = "N", default_value_t = 2)]
    concurrency: usize,

    /// Where failure pages are persisted.
    #[arg(long, value_name = "DIR", default_value = "artifacts")]
    artifact_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let profiles = match collect_profiles(&cli.profiles) {
        Ok(profiles) if profiles.is_empty() => {
            error!("no profiles found");
            return ExitCode::FAILURE;
        }
        Ok(profiles) => profiles,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    info!(count = profiles.len(), "profiles loaded");

    let reporter = FailureReporter::from_env(&cli.artifact_dir);
    let concurrency = cli.concurrency.max(1);
    let mut iter = profiles.into_iter();
    let mut set: JoinSet<bool> = JoinSet::new();

    for _ in 0..concurrency {
        if let Some(profile) = iter.next() {
            set.spawn(run_profile(profile, cli.clone(), reporter.clone()));
        }
    }

    let mut failures = 0usize;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(true) => {}
            Ok(false) => failures += 1,
            Err(e) => {
                error!("run worker failed: {e}");
                failures += 1;
            }
        }
        if let Some(profile) = iter.next() {
            set.spawn(run_profile(profile, cli.clone(), reporter.clone()));
        }
    }

    if failures > 0 {
        error!(failures, "some runs did not complete");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn collect_profiles(paths: &[PathBuf]) -> Result<Vec<SiteProfile>, oripa_watch::EngineError> {
    let mut profiles = Vec::new();
    for path in paths {
        if path.is_dir() {
            profiles.extend(SiteProfile::load_dir(path)?);
        } else {
            profiles.push(SiteProfile::load(path)?);
        }
    }
    Ok(profiles)
}

/// One independent run. Runs share nothing mutable beyond the reporter, so a
/// failing profile never interferes with the others.
async fn run_profile(profile: SiteProfile, cli: Cli, reporter: FailureReporter) -> bool {
    let site = profile.site.clone();

    // Config problems abort before any network call is made.
    let sink = match Sink::from_binding(&site, &profile.sink) {
        Ok(sink) => sink,
        Err(e) => {
            error!(site, error = %e, "sink configuration rejected");
            return false;
        }
    };

    match profile.render {
        RenderMode::Browser => {
            let session =
                match BrowserSession::connect(&cli.webdriver_url, cli.browser, cli.headless, &site)
                    .await
                {
                    Ok(session) => session,
                    Err(e) => {
                        reporter.report_fatal(&site, &e, None).await;
                        return false;
                    }
                };
            run::execute(&profile, session, &sink, &reporter).await.is_ok()
        }
        RenderMode::Fetch => {
            let session = match FetchSession::new(&site) {
                Ok(session) => session,
                Err(e) => {
                    error!(site, error = %e, "fetch session setup failed");
                    return false;
                }
            };
            run::execute(&profile, session, &sink, &reporter).await.is_ok()
        }
    }
}
