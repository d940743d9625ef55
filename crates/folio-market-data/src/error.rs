//! Errors raised while talking to the market-data provider.

use folio_core::FolioError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Provider returned {status} for {symbol}: {message}")]
    Provider {
        status: u16,
        symbol: String,
        message: String,
    },

    #[error("No data for {0}")]
    NoData(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Core(#[from] FolioError),
}

impl From<serde_json::Error> for MarketDataError {
    fn from(e: serde_json::Error) -> Self {
        MarketDataError::Parse(e.to_string())
    }
}

pub type MarketDataResult<T> = Result<T, MarketDataError>;
