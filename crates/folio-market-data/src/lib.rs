//! Market-data client for folio.
//!
//! Downloads daily close history and market capitalisation from the Yahoo
//! Finance chart and quote-summary endpoints and assembles them into
//! `folio_core` price frames.

pub mod error;
pub mod yahoo;

pub use error::{MarketDataError, MarketDataResult};
pub use yahoo::{
    parse_chart_response, parse_market_cap_response, ClientConfig, Fetched, FetchedPrices,
    PriceHistory, YahooClient,
};
