use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use rust_decimal::Decimal;

use crate::error::FolioError;
use crate::types::TickerWeight;
use crate::FolioResult;

const TICKER_HEADER: &str = "Stock";
const WEIGHT_HEADER: &str = "Weight";

/// Order weights largest first, ties broken by ticker.
pub fn sort_weights(weights: &mut [TickerWeight]) {
    weights.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.ticker.cmp(&b.ticker)));
}

/// Write a `Stock,Weight` table, one row per ticker, largest weight first.
pub fn write_weights<W: Write>(writer: W, weights: &[TickerWeight]) -> FolioResult<()> {
    let mut sorted = weights.to_vec();
    sort_weights(&mut sorted);

    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record([TICKER_HEADER, WEIGHT_HEADER])?;
    for tw in &sorted {
        wtr.write_record([tw.ticker.as_str(), tw.weight.to_string().as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_weights_csv(path: impl AsRef<Path>, weights: &[TickerWeight]) -> FolioResult<()> {
    let file = File::create(path.as_ref())?;
    write_weights(file, weights)
}

/// Parse a `Stock,Weight` table. Rows keep file order.
pub fn read_weights<R: Read>(reader: R) -> FolioResult<Vec<TickerWeight>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers()?.clone();
    let col = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| FolioError::InvalidInput {
                field: "weights".into(),
                reason: format!("Missing '{}' column", name),
            })
    };
    let ticker_col = col(TICKER_HEADER)?;
    let weight_col = col(WEIGHT_HEADER)?;

    let mut out = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        let ticker = record.get(ticker_col).unwrap_or("").trim();
        if ticker.is_empty() {
            return Err(FolioError::InvalidInput {
                field: format!("weights row {}", line + 1),
                reason: "Empty ticker".into(),
            });
        }
        let raw = record.get(weight_col).unwrap_or("").trim();
        let weight = raw
            .parse::<Decimal>()
            .or_else(|_| Decimal::from_scientific(raw))
            .map_err(|e| FolioError::InvalidInput {
                field: format!("weights row {}", line + 1),
                reason: format!("Bad weight '{}': {}", raw, e),
            })?;
        if out.iter().any(|tw: &TickerWeight| tw.ticker == ticker) {
            return Err(FolioError::InvalidInput {
                field: "weights".into(),
                reason: format!("Duplicate ticker {}", ticker),
            });
        }
        out.push(TickerWeight::new(ticker, weight));
    }
    Ok(out)
}

pub fn read_weights_csv(path: impl AsRef<Path>) -> FolioResult<Vec<TickerWeight>> {
    let file = File::open(path.as_ref())?;
    read_weights(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn test_written_largest_first() {
        let weights = vec![
            TickerWeight::new("XOM", dec!(0.2)),
            TickerWeight::new("CVX", dec!(0.5)),
            TickerWeight::new("BP", dec!(0.3)),
        ];
        let mut buf = Vec::new();
        write_weights(&mut buf, &weights).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "Stock,Weight\nCVX,0.5\nBP,0.3\nXOM,0.2\n");
    }

    #[test]
    fn test_ties_ordered_by_ticker() {
        let mut weights = vec![
            TickerWeight::new("MSFT", dec!(0.25)),
            TickerWeight::new("AAPL", dec!(0.25)),
            TickerWeight::new("NVDA", dec!(0.5)),
        ];
        sort_weights(&mut weights);
        let order: Vec<&str> = weights.iter().map(|w| w.ticker.as_str()).collect();
        assert_eq!(order, vec!["NVDA", "AAPL", "MSFT"]);
    }

    #[test]
    fn test_read_back() {
        let text = "Stock,Weight\nCVX,0.5\nBP,0.3\nXOM,2e-1\n";
        let weights = read_weights(text.as_bytes()).unwrap();
        assert_eq!(
            weights,
            vec![
                TickerWeight::new("CVX", dec!(0.5)),
                TickerWeight::new("BP", dec!(0.3)),
                TickerWeight::new("XOM", dec!(0.2)),
            ]
        );
    }

    #[test]
    fn test_read_rejects_missing_column() {
        let text = "Ticker,Weight\nCVX,0.5\n";
        assert!(read_weights(text.as_bytes()).is_err());
    }

    #[test]
    fn test_read_rejects_bad_weight_and_duplicates() {
        assert!(read_weights("Stock,Weight\nCVX,lots\n".as_bytes()).is_err());
        assert!(read_weights("Stock,Weight\nCVX,0.5\nCVX,0.5\n".as_bytes()).is_err());
    }
}
