//! Yahoo Finance client.
//!
//! Daily history comes from `/v8/finance/chart/{symbol}` and market
//! capitalisation from `/v10/finance/quoteSummary/{symbol}?modules=price`.
//! Quote-summary calls carry a session crumb tied to a cookie, both obtained
//! once per client.
//! Response parsing is kept separate from HTTP so it can be exercised on
//! captured payloads.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate};
use folio_core::prices::PriceFrame;
use folio_core::types::Money;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{MarketDataError, MarketDataResult};

pub const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";
/// Visited once per client to obtain the session cookie the crumb is tied to.
pub const DEFAULT_CONSENT_URL: &str = "https://fc.yahoo.com";
pub const DEFAULT_INTERVAL: &str = "1d";

/// Closes are stored with this many decimal places.
const PRICE_DECIMALS: u32 = 6;

/// HTTP settings for [`YahooClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub consent_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    /// Use split/dividend adjusted closes when the provider sends them.
    pub adjusted_close: bool,
    /// Pause between consecutive symbols in batch fetches.
    pub pause_between_requests: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            consent_url: DEFAULT_CONSENT_URL.to_string(),
            user_agent: format!("Mozilla/5.0 (compatible; folio/{})", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            adjusted_close: true,
            pause_between_requests: Duration::from_millis(200),
        }
    }
}

/// Daily closes of one symbol, oldest first, one entry per date.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceHistory {
    pub symbol: String,
    pub currency: Option<String>,
    pub closes: Vec<(NaiveDate, Money)>,
}

impl PriceHistory {
    pub fn close_values(&self) -> Vec<Money> {
        self.closes.iter().map(|(_, c)| *c).collect()
    }
}

/// Per-symbol results of a batch fetch, in request order, plus the symbols
/// the provider had no data for.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub values: Vec<(String, T)>,
    pub skipped: Vec<String>,
}

impl<T> Default for Fetched<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// A price frame plus the symbols that had to be left out of it.
#[derive(Debug, Clone)]
pub struct FetchedPrices {
    pub frame: PriceFrame,
    pub skipped: Vec<String>,
}

// ── Yahoo response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChartResponse {
    pub chart: ChartEnvelope,
}

#[derive(Debug, Deserialize)]
pub struct ChartEnvelope {
    #[serde(default)]
    pub result: Option<Vec<ChartResult>>,
    #[serde(default)]
    pub error: Option<ProviderErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderErrorBody {
    pub code: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct ChartResult {
    pub meta: ChartMeta,
    #[serde(default)]
    pub timestamp: Vec<i64>,
    pub indicators: Indicators,
}

#[derive(Debug, Deserialize)]
pub struct ChartMeta {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub currency: Option<String>,
    /// Exchange offset from UTC in seconds
    #[serde(rename = "gmtoffset", default)]
    pub gmt_offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct Indicators {
    #[serde(default)]
    pub quote: Vec<QuoteBlock>,
    #[serde(default)]
    pub adjclose: Vec<AdjCloseBlock>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteBlock {
    #[serde(default)]
    pub close: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
pub struct AdjCloseBlock {
    #[serde(default)]
    pub adjclose: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteSummaryResponse {
    #[serde(rename = "quoteSummary")]
    pub quote_summary: QuoteSummaryEnvelope,
}

#[derive(Debug, Deserialize)]
pub struct QuoteSummaryEnvelope {
    #[serde(default)]
    pub result: Option<Vec<QuoteSummaryResult>>,
    #[serde(default)]
    pub error: Option<ProviderErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteSummaryResult {
    #[serde(default)]
    pub price: Option<PriceModule>,
}

#[derive(Debug, Deserialize)]
pub struct PriceModule {
    #[serde(rename = "marketCap", default)]
    pub market_cap: Option<RawNumber>,
}

#[derive(Debug, Deserialize)]
pub struct RawNumber {
    #[serde(default)]
    pub raw: Option<f64>,
}

// ── Parsing ───────────────────────────────────────────────────────────

/// Turn a chart payload into a [`PriceHistory`].
///
/// Null and non-finite closes are skipped. Timestamps are shifted by the
/// exchange offset before taking the calendar date; if two bars land on
/// the same date the later one wins.
pub fn parse_chart_response(
    symbol: &str,
    body: &str,
    adjusted_close: bool,
) -> MarketDataResult<PriceHistory> {
    let response: ChartResponse = serde_json::from_str(body)?;
    if let Some(err) = response.chart.error {
        return Err(provider_error(symbol, err));
    }
    let result = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| MarketDataError::NoData(symbol.to_string()))?;

    let adjusted = result
        .indicators
        .adjclose
        .first()
        .map(|b| &b.adjclose)
        .filter(|v| adjusted_close && !v.is_empty());
    let series = match adjusted {
        Some(v) => v,
        None => match result.indicators.quote.first() {
            Some(q) => &q.close,
            None => return Err(MarketDataError::NoData(symbol.to_string())),
        },
    };
    if series.len() != result.timestamp.len() {
        return Err(MarketDataError::Parse(format!(
            "{}: {} timestamps but {} closes",
            symbol,
            result.timestamp.len(),
            series.len()
        )));
    }

    let mut closes: Vec<(NaiveDate, Money)> = Vec::with_capacity(series.len());
    for (ts, close) in result.timestamp.iter().zip(series.iter()) {
        let Some(price) = close.and_then(Decimal::from_f64) else {
            continue;
        };
        let date = DateTime::from_timestamp(ts + result.meta.gmt_offset, 0)
            .ok_or_else(|| {
                MarketDataError::Parse(format!("{}: timestamp {} out of range", symbol, ts))
            })?
            .date_naive();
        let price = price.round_dp(PRICE_DECIMALS).normalize();
        match closes.last_mut() {
            Some((last, value)) if *last == date => *value = price,
            Some((last, _)) if *last > date => {
                return Err(MarketDataError::Parse(format!(
                    "{}: timestamps are not increasing at {}",
                    symbol, date
                )));
            }
            _ => closes.push((date, price)),
        }
    }

    if closes.is_empty() {
        return Err(MarketDataError::NoData(symbol.to_string()));
    }

    Ok(PriceHistory {
        symbol: if result.meta.symbol.is_empty() {
            symbol.to_string()
        } else {
            result.meta.symbol
        },
        currency: result.meta.currency,
        closes,
    })
}

/// Extract `price.marketCap.raw` from a quote-summary payload.
pub fn parse_market_cap_response(symbol: &str, body: &str) -> MarketDataResult<Money> {
    let response: QuoteSummaryResponse = serde_json::from_str(body)?;
    if let Some(err) = response.quote_summary.error {
        return Err(provider_error(symbol, err));
    }
    let raw = response
        .quote_summary
        .result
        .and_then(|r| r.into_iter().next())
        .and_then(|r| r.price)
        .and_then(|p| p.market_cap)
        .and_then(|m| m.raw)
        .ok_or_else(|| MarketDataError::NoData(format!("{} market cap", symbol)))?;

    let cap = Decimal::from_f64(raw)
        .ok_or_else(|| MarketDataError::Parse(format!("{}: market cap {} is not finite", symbol, raw)))?
        .round_dp(0);
    if cap <= Decimal::ZERO {
        return Err(MarketDataError::NoData(format!("{} market cap", symbol)));
    }
    Ok(cap)
}

fn provider_error(symbol: &str, err: ProviderErrorBody) -> MarketDataError {
    if err.code.eq_ignore_ascii_case("not found") {
        MarketDataError::NoData(symbol.to_string())
    } else {
        MarketDataError::Provider {
            status: 200,
            symbol: symbol.to_string(),
            message: format!("{}: {}", err.code, err.description),
        }
    }
}

// ── Client ────────────────────────────────────────────────────────────

/// Yahoo Finance client with connection pooling, a cookie store and a
/// cached quote-summary crumb.
#[derive(Debug, Clone)]
pub struct YahooClient {
    client: reqwest::Client,
    config: ClientConfig,
    crumb: Arc<OnceCell<String>>,
}

impl YahooClient {
    pub fn new(config: ClientConfig) -> MarketDataResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .cookie_store(true)
            .pool_max_idle_per_host(4)
            .timeout(config.timeout)
            .build()
            .map_err(|e| MarketDataError::Http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            crumb: Arc::new(OnceCell::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Fetch daily closes for `symbol` over a provider range such as `1y`.
    pub async fn fetch_history(
        &self,
        symbol: &str,
        range: &str,
        interval: &str,
    ) -> MarketDataResult<PriceHistory> {
        let url = chart_url(&self.config.base_url, symbol, range, interval)?;
        let body = self.get_text(url, symbol).await?;
        let history = parse_chart_response(symbol, &body, self.config.adjusted_close)?;

        debug!("Got {} closes for {}", history.closes.len(), symbol);
        Ok(history)
    }

    /// Fetch the current market capitalisation of `symbol`.
    pub async fn fetch_market_cap(&self, symbol: &str) -> MarketDataResult<Money> {
        let crumb = self.crumb().await?;
        let url = quote_summary_url(&self.config.base_url, symbol, crumb)?;
        let body = self.get_text(url, symbol).await?;
        parse_market_cap_response(symbol, &body)
    }

    /// Histories for every symbol, paced by `pause_between_requests`.
    ///
    /// Symbols the provider has no data for are skipped; any other failure
    /// aborts the whole batch.
    pub async fn fetch_histories(
        &self,
        symbols: &[String],
        range: &str,
        interval: &str,
    ) -> MarketDataResult<Fetched<PriceHistory>> {
        let mut fetched = Fetched::default();
        for (i, symbol) in symbols.iter().enumerate() {
            self.pace(i).await;
            match self.fetch_history(symbol, range, interval).await {
                Ok(history) => fetched.values.push((symbol.clone(), history)),
                Err(MarketDataError::NoData(what)) => {
                    warn!("Skipping {}: no data for {}", symbol, what);
                    fetched.skipped.push(symbol.clone());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(fetched)
    }

    /// Market caps for every symbol, paced like [`Self::fetch_histories`].
    pub async fn fetch_market_caps(&self, symbols: &[String]) -> MarketDataResult<Fetched<Money>> {
        let mut fetched = Fetched::default();
        for (i, symbol) in symbols.iter().enumerate() {
            self.pace(i).await;
            match self.fetch_market_cap(symbol).await {
                Ok(cap) => fetched.values.push((symbol.clone(), cap)),
                Err(MarketDataError::NoData(what)) => {
                    warn!("Skipping {}: no data for {}", symbol, what);
                    fetched.skipped.push(symbol.clone());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(fetched)
    }

    /// Download every symbol and align them into a forward-filled frame.
    ///
    /// Symbols without data are skipped with a warning; the call fails when
    /// none are left or when any request fails for another reason.
    pub async fn fetch_price_frame(
        &self,
        symbols: &[String],
        range: &str,
    ) -> MarketDataResult<FetchedPrices> {
        if symbols.is_empty() {
            return Err(MarketDataError::Core(folio_core::FolioError::InvalidInput {
                field: "symbols".into(),
                reason: "At least one symbol required".into(),
            }));
        }

        let fetched = self.fetch_histories(symbols, range, DEFAULT_INTERVAL).await?;
        if fetched.values.is_empty() {
            return Err(MarketDataError::NoData(symbols.join(", ")));
        }

        let series = fetched
            .values
            .into_iter()
            .map(|(symbol, history)| (symbol, history.closes))
            .collect();
        let mut frame = PriceFrame::from_series(series)?;
        frame.forward_fill();
        info!(
            "Fetched {} symbols x {} dates ({} skipped)",
            frame.tickers.len(),
            frame.len(),
            fetched.skipped.len()
        );
        Ok(FetchedPrices {
            frame,
            skipped: fetched.skipped,
        })
    }

    async fn pace(&self, index: usize) {
        if index > 0 && !self.config.pause_between_requests.is_zero() {
            tokio::time::sleep(self.config.pause_between_requests).await;
        }
    }

    /// Session crumb for quote-summary calls, fetched once per client.
    ///
    /// The consent host sets the session cookie (its status is ignored);
    /// `/v1/test/getcrumb` then returns the crumb as plain text.
    async fn crumb(&self) -> MarketDataResult<&str> {
        let crumb = self
            .crumb
            .get_or_try_init(|| async {
                debug!("Fetching session cookie from {}", self.config.consent_url);
                self.client
                    .get(self.config.consent_url.as_str())
                    .send()
                    .await
                    .map_err(|e| MarketDataError::Http(format!("session cookie: {}", e)))?;

                let url = endpoint(&self.config.base_url, &["v1", "test", "getcrumb"])?;
                let body = self.get_text(url, "crumb").await.map_err(|e| match e {
                    MarketDataError::NoData(_) => MarketDataError::Provider {
                        status: 404,
                        symbol: "crumb".into(),
                        message: "crumb endpoint not found".into(),
                    },
                    e => e,
                })?;
                let crumb = body.trim();
                if crumb.is_empty() || crumb.contains(char::is_whitespace) || crumb.contains('<') {
                    return Err(MarketDataError::Parse(format!(
                        "unexpected crumb response: {}",
                        truncate(crumb, 100)
                    )));
                }
                debug!("Got session crumb");
                Ok::<_, MarketDataError>(crumb.to_string())
            })
            .await?;
        Ok(crumb.as_str())
    }

    async fn get_text(&self, url: reqwest::Url, symbol: &str) -> MarketDataResult<String> {
        debug!("Fetching {}", url);

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MarketDataError::Http(format!("{}: {}", symbol, e)))?;

        let status = resp.status().as_u16();
        if status == 404 {
            return Err(MarketDataError::NoData(symbol.to_string()));
        }
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(MarketDataError::Provider {
                status,
                symbol: symbol.to_string(),
                message: truncate(&body, 500).to_string(),
            });
        }

        resp.text()
            .await
            .map_err(|e| MarketDataError::Http(format!("{}: {}", symbol, e)))
    }
}

// ── URLs ──────────────────────────────────────────────────────────────

/// `base_url` with `segments` appended, each percent-encoded as one segment.
fn endpoint(base_url: &str, segments: &[&str]) -> MarketDataResult<reqwest::Url> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|e| MarketDataError::Http(format!("bad base URL {}: {}", base_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| MarketDataError::Http(format!("bad base URL {}", base_url)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn chart_url(
    base_url: &str,
    symbol: &str,
    range: &str,
    interval: &str,
) -> MarketDataResult<reqwest::Url> {
    let mut url = endpoint(base_url, &["v8", "finance", "chart", symbol])?;
    url.query_pairs_mut()
        .append_pair("range", range)
        .append_pair("interval", interval);
    Ok(url)
}

fn quote_summary_url(base_url: &str, symbol: &str, crumb: &str) -> MarketDataResult<reqwest::Url> {
    let mut url = endpoint(base_url, &["v10", "finance", "quoteSummary", symbol])?;
    url.query_pairs_mut()
        .append_pair("modules", "price")
        .append_pair("crumb", crumb);
    Ok(url)
}

/// Longest prefix of at most `max` bytes that ends on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn chart(timestamps: &str, closes: &str, adjclose: &str) -> String {
        format!(
            r#"{{"chart":{{"result":[{{"meta":{{"symbol":"XOM","currency":"USD","gmtoffset":-18000}},
            "timestamp":[{}],
            "indicators":{{"quote":[{{"close":[{}]}}],"adjclose":[{{"adjclose":[{}]}}]}}}}],
            "error":null}}}}"#,
            timestamps, closes, adjclose
        )
    }

    #[test]
    fn test_chart_skips_null_closes() {
        // 2024-01-02 14:30 UTC, 2024-01-03 14:30 UTC, 2024-01-04 14:30 UTC
        let body = chart(
            "1704205800,1704292200,1704378600",
            "101.5,null,103.25",
            "100.0,null,102.0",
        );
        let h = parse_chart_response("XOM", &body, false).unwrap();
        assert_eq!(
            h.closes,
            vec![
                (NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), dec!(101.5)),
                (NaiveDate::from_ymd_opt(2024, 1, 4).unwrap(), dec!(103.25)),
            ]
        );
        assert_eq!(h.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn test_chart_prefers_adjusted_close() {
        let body = chart("1704205800", "101.5", "99.75");
        let h = parse_chart_response("XOM", &body, true).unwrap();
        assert_eq!(h.close_values(), vec![dec!(99.75)]);
    }

    #[test]
    fn test_chart_same_day_bar_replaced() {
        // Second bar is a live quote on the same exchange date.
        let body = chart("1704205800,1704229200", "101.5,102", "101.5,102");
        let h = parse_chart_response("XOM", &body, true).unwrap();
        assert_eq!(h.closes.len(), 1);
        assert_eq!(h.closes[0].1, dec!(102));
    }

    #[test]
    fn test_chart_all_null_is_no_data() {
        let body = chart("1704205800", "null", "null");
        assert!(matches!(
            parse_chart_response("XOM", &body, true),
            Err(MarketDataError::NoData(_))
        ));
    }

    #[test]
    fn test_chart_not_found() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        assert!(matches!(
            parse_chart_response("NOPE", body, true),
            Err(MarketDataError::NoData(s)) if s == "NOPE"
        ));
    }

    #[test]
    fn test_chart_other_provider_error() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Bad Request","description":"Invalid input - interval=7m is not supported"}}}"#;
        assert!(matches!(
            parse_chart_response("XOM", body, true),
            Err(MarketDataError::Provider { .. })
        ));
    }

    #[test]
    fn test_chart_length_mismatch() {
        let body = chart("1704205800,1704292200", "101.5", "101.5");
        assert!(matches!(
            parse_chart_response("XOM", &body, true),
            Err(MarketDataError::Parse(_))
        ));
    }

    #[test]
    fn test_market_cap() {
        let body = r#"{"quoteSummary":{"result":[{"price":{"marketCap":{"raw":4.6342e11,"fmt":"463.42B"}}}],"error":null}}"#;
        assert_eq!(parse_market_cap_response("XOM", body).unwrap(), dec!(463420000000));
    }

    #[test]
    fn test_market_cap_missing_for_fund() {
        let body = r#"{"quoteSummary":{"result":[{"price":{"marketCap":{}}}],"error":null}}"#;
        assert!(matches!(
            parse_market_cap_response("ARKK", body),
            Err(MarketDataError::NoData(_))
        ));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("ééé", 3), "é");
    }

    #[test]
    fn test_endpoint_keeps_symbol_in_one_segment() {
        let url = endpoint(DEFAULT_BASE_URL, &["v8", "finance", "chart", "005930.KS"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://query1.finance.yahoo.com/v8/finance/chart/005930.KS"
        );
        let url = endpoint(DEFAULT_BASE_URL, &["v8", "finance", "chart", "BRK/B"]).unwrap();
        assert!(url.as_str().ends_with("/chart/BRK%2FB"));
    }

    #[test]
    fn test_chart_url_query() {
        let url = chart_url(DEFAULT_BASE_URL, "XOM", "5y", "1d").unwrap();
        assert_eq!(
            url.as_str(),
            "https://query1.finance.yahoo.com/v8/finance/chart/XOM?range=5y&interval=1d"
        );
    }

    #[test]
    fn test_quote_summary_url_carries_crumb() {
        let url = quote_summary_url(DEFAULT_BASE_URL, "CVX", "aB3/x.Yz").unwrap();
        assert_eq!(
            url.as_str(),
            "https://query1.finance.yahoo.com/v10/finance/quoteSummary/CVX?modules=price&crumb=aB3%2Fx.Yz"
        );
        let crumb = url
            .query_pairs()
            .find(|(k, _)| k == "crumb")
            .map(|(_, v)| v.into_owned());
        assert_eq!(crumb.as_deref(), Some("aB3/x.Yz"));
    }
}
