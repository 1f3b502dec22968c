//! HTTP-level runs against a scripted local listener: webhook notification on
//! a fatal abort, the REST sink round trip, and WebDriver readiness probing.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use oripa_watch::error::EngineError;
use oripa_watch::extract::Record;
use oripa_watch::profile::{ExtractSpec, ReadyCheck, RenderMode, SinkBinding, SiteProfile};
use oripa_watch::report::FailureReporter;
use oripa_watch::run;
use oripa_watch::session::{BrowserKind, BrowserSession, FetchSession, PageSession};
use oripa_watch::sink::{SINK_PASS_ENV, SINK_USER_ENV, Sink};

/// Local HTTP responder that replies from a canned (status, body) queue and
/// records every request it saw, head and body together.
struct Scripted {
    url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Scripted {
    async fn spawn(responses: Vec<(u16, &str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        let mut queue = responses
            .into_iter()
            .map(|(status, body)| (status, body.to_string()))
            .collect::<VecDeque<_>>();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                while let Some(request) = read_request(&mut stream).await {
                    log.lock().unwrap().push(request);
                    let (status, body) = queue.pop_front().unwrap_or((200, String::new()));
                    let reason = if status < 400 { "OK" } else { "NG" };
                    let reply = format!(
                        "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if stream.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });

        Self { url, requests }
    }

    fn seen(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Some(format!("{head}{}", String::from_utf8_lossy(&body)))
}

fn set_sink_credentials() {
    // set_var is process-global; every test here writes the same pair.
    unsafe {
        std::env::set_var(SINK_USER_ENV, "scout");
        std::env::set_var(SINK_PASS_ENV, "secret");
    }
}

fn record(n: usize, value: Option<u64>, unit: &str) -> Record {
    Record {
        title: format!("Pack {n}"),
        image_url: format!("https://cdn.example.com/pack{n}.jpg"),
        detail_url: format!("https://shop.example.com/items/{n}"),
        value,
        unit: Some(unit.to_string()),
        extra: BTreeMap::new(),
    }
}

#[tokio::test]
async fn fatal_abort_sends_exactly_one_webhook_notification() {
    // A server-rendered page with none of the expected item elements.
    let page = Scripted::spawn(vec![(200, "<html><body><p>maintenance</p></body></html>")]).await;
    let webhook = Scripted::spawn(vec![(200, "")]).await;
    let dir = tempfile::TempDir::new().unwrap();

    let profile = SiteProfile {
        site: "fake".to_string(),
        url: page.url.clone(),
        render: RenderMode::Fetch,
        ready: ReadyCheck::Exists {
            selector: ".card".to_string(),
            min_count: 1,
        },
        extract: ExtractSpec::Selectors {
            item: ".card".to_string(),
            fields: BTreeMap::new(),
        },
        scroll: None,
        detail: None,
        sink: SinkBinding::Sheet {
            path: dir.path().join("fake.csv").to_string_lossy().into_owned(),
            refresh_values: false,
        },
        timeout_ms: 1_000,
    };
    let session = FetchSession::new("fake").unwrap();
    let sink = Sink::from_binding("fake", &profile.sink).unwrap();
    let reporter = FailureReporter::new(dir.path(), Some(webhook.url.clone()));

    let err = run::execute(&profile, session, &sink, &reporter)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ReadinessTimeout { .. }));

    let posts = webhook.seen();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].starts_with("POST / "));
    assert!(posts[0].contains(r#"{"text":"["#));
    assert!(posts[0].contains("fake run aborted: page never stabilized"));
}

#[tokio::test]
async fn rest_sink_reads_index_and_posts_batch_with_basic_auth() {
    set_sink_credentials();
    let server = Scripted::spawn(vec![
        (200, r#"["https://shop.example.com/items/1?utm_source=x"]"#),
        (200, "{}"),
    ])
    .await;
    let binding = SinkBinding::Rest {
        endpoint: format!("{}/items", server.url),
        index_endpoint: None,
    };
    let sink = Sink::from_binding("fake", &binding).unwrap();

    let keys = sink.existing_keys().await.unwrap();
    assert!(keys.contains("https://shop.example.com/items/1"));

    let report = sink
        .write(&[record(2, Some(1000), "円"), record(3, Some(300), "pt")])
        .await
        .unwrap();
    assert_eq!(report.written, 2);

    let seen = server.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].starts_with("GET /items "));
    assert!(seen[0].contains("Basic c2NvdXQ6c2VjcmV0"));
    assert!(seen[1].starts_with("POST /items "));
    assert!(seen[1].contains("Basic c2NvdXQ6c2VjcmV0"));
    // Yen-denominated value lands in price, points stay points.
    assert!(seen[1].contains(r#""price":1000"#));
    assert!(seen[1].contains(r#""points":300"#));
    assert!(seen[1].contains(r#""source_slug":"fake""#));
}

#[tokio::test]
async fn rest_sink_surfaces_upsert_rejection() {
    set_sink_credentials();
    let server = Scripted::spawn(vec![(500, r#"{"error":"schema mismatch"}"#)]).await;
    let binding = SinkBinding::Rest {
        endpoint: format!("{}/items", server.url),
        index_endpoint: None,
    };
    let sink = Sink::from_binding("fake", &binding).unwrap();

    let err = sink.write(&[record(1, Some(100), "pt")]).await.unwrap_err();
    assert!(matches!(err, EngineError::Write(_)));
    assert!(err.to_string().contains("HTTP 500"));
}

#[tokio::test]
async fn readiness_wait_retries_after_transient_driver_error() {
    let driver = Scripted::spawn(vec![
        (200, r#"{"value":{"sessionId":"abc"}}"#),
        (500, "internal error"),
        (200, r#"{"value":2}"#),
    ])
    .await;

    let mut session = BrowserSession::connect(&driver.url, BrowserKind::Chrome, true, "fake")
        .await
        .unwrap();
    let check = ReadyCheck::Exists {
        selector: ".card".to_string(),
        min_count: 1,
    };
    session
        .await_ready(&check, Duration::from_secs(5))
        .await
        .unwrap();

    // Session create, the failed count check, then the successful retry.
    let seen = driver.seen();
    assert_eq!(seen.len(), 3);
    assert!(seen[1].contains("/session/abc/execute/sync"));
    assert!(seen[2].contains("/session/abc/execute/sync"));
}
