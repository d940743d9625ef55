use std::collections::BTreeMap;
use std::fs;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Settings shared by every command, read from an optional YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FolioConfig {
    pub risk_free_rate: Decimal,
    pub trading_days: u32,
    /// Provider range for optimisation history (e.g. "1y", "5y")
    pub history_range: String,
    pub portfolio_value: Decimal,
    pub weight_cutoff: Decimal,
    pub weight_decimals: u32,
    pub rsi_window: usize,
    /// Provider range for RSI history
    pub rsi_range: String,
    pub rsi_overbought: Decimal,
    pub rsi_oversold: Decimal,
    /// Extra or overriding universes, merged over the built-in ones
    pub universes: BTreeMap<String, Vec<String>>,
}

impl Default for FolioConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: dec!(0.02),
            trading_days: 252,
            history_range: "5y".into(),
            portfolio_value: dec!(10000),
            weight_cutoff: dec!(0.0001),
            weight_decimals: 5,
            rsi_window: 14,
            rsi_range: "6mo".into(),
            rsi_overbought: dec!(70),
            rsi_oversold: dec!(30),
            universes: BTreeMap::new(),
        }
    }
}

impl FolioConfig {
    /// Load from `path`, or return the defaults when no path is given.
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config '{}': {}", path, e))?;
        let config = Self::from_yaml(&contents)
            .map_err(|e| format!("Failed to parse config '{}': {}", path, e))?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Built-in universes overlaid with the configured ones.
    pub fn all_universes(&self) -> BTreeMap<String, Vec<String>> {
        let mut all = builtin_universes();
        for (name, tickers) in &self.universes {
            all.insert(name.to_lowercase(), dedupe(tickers.iter().map(String::as_str)));
        }
        all
    }

    pub fn universe(&self, name: &str) -> Option<Vec<String>> {
        self.all_universes().remove(&name.to_lowercase())
    }
}

const ENERGY: &[&str] = &[
    "XOM", "CVX", "COP", "HES", "OXY", "EOG", "MPC", "PSX", "VLO", "ENB", "SU", "CNQ", "CVE",
    "IMO", "BP", "EQNR", "IBE", "WMB", "OKE", "ET", "HOU", "CQP", "BKR", "TRGP", "TGTX", "AR",
    "VLO", "KMI", "PPL", "DUK", "XEL",
];

const CONSUMER: &[&str] = &[
    "PG", "KO", "PEP", "JNJ", "CL", "UL", "GIS", "KMB", "MDLZ", "COLM", "EL", "MCD", "PM",
    "HSY", "CAG", "LRLCF", "KHC", "OR", "DGE", "IMB", "RB", "BN", "7203.T", "005930.KS",
    "066570.KS", "CX", "BABA", "AMZN", "TGT", "WMT", "COST", "TJX", "LOW", "NKE", "SBUX", "K",
];

const INDUSTRIAL_MATERIALS: &[&str] = &[
    "LIN", "NEM", "SCCO", "RIO", "VMC", "APD", "DD", "VALE", "XOM", "LMT", "MMM", "CAT", "DE",
    "GE", "CSX", "ECL", "DOW", "FCX", "FLS", "JCI", "AME", "IP", "PKG", "EMR", "X", "GWW",
    "CNI", "ITW", "HON", "IEX", "RS", "STLD", "NUE", "VLO", "PHM", "TMO",
];

const TECH: &[&str] = &[
    "AAPL", "MSFT", "GOOGL", "GOOG", "NVDA", "META", "AMZN", "TSLA", "AMD", "IBM", "ORCL",
    "CRM", "INTC", "CSCO", "ADBE", "SAP", "TXN", "AVGO", "QCOM", "NOW", "ASML", "ZM", "SHOP",
    "SNOW", "PLTR", "UBER", "SQ", "NET", "ARKK", "TWLO", "DOCU", "DDOG", "CRWD", "ROKU", "MDB",
    "PINS", "FSLY", "AI", "BBAI", "SOUN", "ERIC", "NOK", "INFY", "WIT", "GLBE", "ADSK", "TEAM",
    "WDAY", "RBLX", "ESTC", "U", "AFRM", "OKTA", "ZI", "DUOL", "FVRR", "SE", "BIDU", "JD",
    "BABA", "BYND", "CHWY", "PRTC.L", "OCDO.L", "AMS", "IFX", "STM", "NXPI", "ROG.SW", "UBI.PA",
    "AUTO.L", "XPEV", "LI", "NTES",
];

pub fn builtin_universes() -> BTreeMap<String, Vec<String>> {
    [
        ("energy", ENERGY),
        ("consumer", CONSUMER),
        ("industrial-materials", INDUSTRIAL_MATERIALS),
        ("tech", TECH),
    ]
    .into_iter()
    .map(|(name, tickers)| (name.to_string(), dedupe(tickers.iter().copied())))
    .collect()
}

/// Trimmed, upper-cased tickers in first-seen order without repeats.
pub fn dedupe<'a>(tickers: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for t in tickers {
        let t = t.trim().to_uppercase();
        if !t.is_empty() && !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

/// `industrial-materials` -> `IndustrialMaterials`
pub fn pascal_case(name: &str) -> String {
    name.split(|c: char| c == '-' || c == '_' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
