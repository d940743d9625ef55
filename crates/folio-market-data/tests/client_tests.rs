use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use folio_market_data::{ClientConfig, MarketDataError, YahooClient};
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const CHART_CVX: &str = include_str!("fixtures/chart_cvx_5d.json");
const CHART_NOT_FOUND: &str = include_str!("fixtures/chart_not_found.json");
const QUOTE_SUMMARY_CVX: &str = include_str!("fixtures/quote_summary_cvx.json");

const INVALID_CRUMB: &str =
    r#"{"finance":{"result":null,"error":{"code":"Unauthorized","description":"Invalid Crumb"}}}"#;

struct Reply {
    status: u16,
    body: String,
    headers: String,
}

impl Reply {
    fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            headers: String::new(),
        }
    }
}

type Handler = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        429 => "Too Many Requests",
        _ => "Error",
    }
}

/// Serve `handler` on a local port; returns the base URL.
async fn spawn_provider(handler: Handler) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let mut len = 0;
                while len < buf.len() {
                    let n = socket.read(&mut buf[len..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    len += n;
                    if buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&buf[..len]).to_string();
                let target = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let reply = handler(&target);
                let response = format!(
                    "HTTP/1.1 {} {}\r\ncontent-length: {}\r\nconnection: close\r\n{}\r\n{}",
                    reply.status,
                    reason(reply.status),
                    reply.body.len(),
                    reply.headers,
                    reply.body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{}", addr)
}

fn client_for(base_url: &str) -> YahooClient {
    YahooClient::new(ClientConfig {
        base_url: base_url.to_string(),
        consent_url: format!("{}/consent", base_url),
        pause_between_requests: Duration::ZERO,
        timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    })
    .unwrap()
}

fn symbols(s: &[&str]) -> Vec<String> {
    s.iter().map(|t| t.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Batch history: only missing symbols are skipped
// ---------------------------------------------------------------------------

fn chart_handler() -> Handler {
    Arc::new(|target: &str| {
        if target.starts_with("/v8/finance/chart/CVX?") {
            Reply::new(200, CHART_CVX)
        } else if target.starts_with("/v8/finance/chart/GONE?") {
            Reply::new(404, CHART_NOT_FOUND)
        } else if target.starts_with("/v8/finance/chart/DELISTED?") {
            Reply::new(200, CHART_NOT_FOUND)
        } else if target.starts_with("/v8/finance/chart/BUSY?") {
            Reply::new(429, "Too Many Requests")
        } else if target.starts_with("/v8/finance/chart/HTML?") {
            Reply::new(200, "<html>Will be right back</html>")
        } else {
            Reply::new(500, "unexpected request")
        }
    })
}

#[tokio::test]
async fn test_price_frame_skips_symbols_without_data() {
    let base = spawn_provider(chart_handler()).await;
    let client = client_for(&base);

    let fetched = client
        .fetch_price_frame(&symbols(&["CVX", "GONE", "DELISTED"]), "5d")
        .await
        .unwrap();

    assert_eq!(fetched.frame.tickers, vec!["CVX".to_string()]);
    assert_eq!(fetched.frame.len(), 4);
    assert_eq!(fetched.skipped, symbols(&["GONE", "DELISTED"]));
}

#[tokio::test]
async fn test_rate_limited_symbol_aborts_batch() {
    let base = spawn_provider(chart_handler()).await;
    let client = client_for(&base);

    let err = client
        .fetch_price_frame(&symbols(&["CVX", "BUSY"]), "5d")
        .await
        .unwrap_err();

    assert!(
        matches!(&err, MarketDataError::Provider { status: 429, symbol, .. } if symbol == "BUSY"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn test_unparseable_body_aborts_batch() {
    let base = spawn_provider(chart_handler()).await;
    let client = client_for(&base);

    let err = client
        .fetch_histories(&symbols(&["HTML", "CVX"]), "5d", "1d")
        .await
        .unwrap_err();
    assert!(matches!(err, MarketDataError::Parse(_)));
}

#[tokio::test]
async fn test_no_symbol_with_data_is_no_data() {
    let base = spawn_provider(chart_handler()).await;
    let client = client_for(&base);

    let err = client
        .fetch_price_frame(&symbols(&["GONE"]), "5d")
        .await
        .unwrap_err();
    assert!(matches!(err, MarketDataError::NoData(_)));
}

// ---------------------------------------------------------------------------
// Market caps: cookie + crumb session
// ---------------------------------------------------------------------------

fn quote_handler(consent_hits: Arc<AtomicUsize>, crumb_hits: Arc<AtomicUsize>) -> Handler {
    Arc::new(move |target: &str| {
        if target == "/consent" {
            consent_hits.fetch_add(1, Ordering::SeqCst);
            Reply {
                status: 404,
                body: String::new(),
                headers: "set-cookie: A3=session; Path=/\r\n".into(),
            }
        } else if target == "/v1/test/getcrumb" {
            crumb_hits.fetch_add(1, Ordering::SeqCst);
            Reply::new(200, "cRumB.42")
        } else if target.starts_with("/v10/finance/quoteSummary/") {
            if target.ends_with("modules=price&crumb=cRumB.42") {
                Reply::new(200, QUOTE_SUMMARY_CVX)
            } else {
                Reply::new(401, INVALID_CRUMB)
            }
        } else {
            Reply::new(500, "unexpected request")
        }
    })
}

#[tokio::test]
async fn test_market_caps_fetch_crumb_once() {
    let consent_hits = Arc::new(AtomicUsize::new(0));
    let crumb_hits = Arc::new(AtomicUsize::new(0));
    let base = spawn_provider(quote_handler(consent_hits.clone(), crumb_hits.clone())).await;
    let client = client_for(&base);

    let caps = client
        .fetch_market_caps(&symbols(&["CVX", "XOM"]))
        .await
        .unwrap();

    assert_eq!(
        caps.values,
        vec![
            ("CVX".to_string(), dec!(279421566976)),
            ("XOM".to_string(), dec!(279421566976)),
        ]
    );
    assert!(caps.skipped.is_empty());
    assert_eq!(consent_hits.load(Ordering::SeqCst), 1);
    assert_eq!(crumb_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_crumb_is_an_error() {
    let handler: Handler = Arc::new(|target: &str| {
        if target == "/consent" {
            Reply::new(404, "")
        } else if target == "/v1/test/getcrumb" {
            Reply::new(200, "stale")
        } else {
            Reply::new(401, INVALID_CRUMB)
        }
    });
    let base = spawn_provider(handler).await;
    let client = client_for(&base);

    let err = client
        .fetch_market_caps(&symbols(&["CVX"]))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketDataError::Provider { status: 401, .. }));
}

#[tokio::test]
async fn test_html_crumb_is_rejected() {
    let handler: Handler = Arc::new(|target: &str| {
        if target == "/v1/test/getcrumb" {
            Reply::new(200, "<html>consent required</html>")
        } else {
            Reply::new(404, "")
        }
    });
    let base = spawn_provider(handler).await;
    let client = client_for(&base);

    let err = client.fetch_market_cap("CVX").await.unwrap_err();
    assert!(matches!(err, MarketDataError::Parse(_)));
}
