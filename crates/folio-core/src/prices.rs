use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FolioError;
use crate::types::Money;
use crate::FolioResult;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Close prices for a set of tickers aligned on a common date index.
///
/// `closes[row][col]` is the close of `tickers[col]` on `dates[row]`;
/// `None` marks a day with no observation for that ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceFrame {
    pub dates: Vec<NaiveDate>,
    pub tickers: Vec<String>,
    pub closes: Vec<Vec<Option<Money>>>,
}

impl PriceFrame {
    /// Align per-ticker series on the sorted union of their dates.
    ///
    /// Duplicate tickers are rejected; within a series the last close seen
    /// for a date wins.
    pub fn from_series(series: Vec<(String, Vec<(NaiveDate, Money)>)>) -> FolioResult<Self> {
        let mut seen = BTreeSet::new();
        for (ticker, _) in &series {
            if !seen.insert(ticker.as_str()) {
                return Err(FolioError::InvalidInput {
                    field: "tickers".into(),
                    reason: format!("Duplicate ticker {}", ticker),
                });
            }
        }

        let dates: Vec<NaiveDate> = series
            .iter()
            .flat_map(|(_, obs)| obs.iter().map(|(d, _)| *d))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let row_of: BTreeMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let mut closes = vec![vec![None; series.len()]; dates.len()];
        for (col, (_, obs)) in series.iter().enumerate() {
            for (date, close) in obs {
                closes[row_of[date]][col] = Some(*close);
            }
        }

        Ok(Self {
            dates,
            tickers: series.into_iter().map(|(t, _)| t).collect(),
            closes,
        })
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty() || self.tickers.is_empty()
    }

    /// Column index of a ticker.
    pub fn position(&self, ticker: &str) -> Option<usize> {
        self.tickers.iter().position(|t| t == ticker)
    }

    /// Carry the last observed close forward over gaps. Leading gaps stay empty.
    pub fn forward_fill(&mut self) {
        let mut last: Vec<Option<Money>> = vec![None; self.tickers.len()];
        for row in self.closes.iter_mut() {
            for (col, cell) in row.iter_mut().enumerate() {
                match cell {
                    Some(v) => last[col] = Some(*v),
                    None => *cell = last[col],
                }
            }
        }
    }

    /// All closes of a ticker in date order, including gaps.
    pub fn column(&self, ticker: &str) -> FolioResult<Vec<Option<Money>>> {
        let col = self.position(ticker).ok_or_else(|| unknown_ticker(ticker))?;
        Ok(self.closes.iter().map(|row| row[col]).collect())
    }

    /// Observed closes of a ticker, skipping gaps.
    pub fn observed(&self, ticker: &str) -> FolioResult<Vec<Money>> {
        Ok(self.column(ticker)?.into_iter().flatten().collect())
    }

    /// A new frame restricted to `tickers`, in that order.
    pub fn select(&self, tickers: &[String]) -> FolioResult<Self> {
        let cols = tickers
            .iter()
            .map(|t| self.position(t).ok_or_else(|| unknown_ticker(t)))
            .collect::<FolioResult<Vec<_>>>()?;
        Ok(Self {
            dates: self.dates.clone(),
            tickers: tickers.to_vec(),
            closes: self
                .closes
                .iter()
                .map(|row| cols.iter().map(|&c| row[c]).collect())
                .collect(),
        })
    }

    /// Most recent close of every ticker.
    pub fn latest_prices(&self) -> FolioResult<BTreeMap<String, Money>> {
        self.tickers
            .iter()
            .enumerate()
            .map(|(col, ticker)| {
                self.closes
                    .iter()
                    .rev()
                    .find_map(|row| row[col])
                    .map(|p| (ticker.clone(), p))
                    .ok_or_else(|| {
                        FolioError::InsufficientData(format!("No price observed for {}", ticker))
                    })
            })
            .collect()
    }

    /// Parse a `Date,<ticker>,...` CSV. Empty cells are missing closes.
    pub fn read_csv<R: Read>(reader: R) -> FolioResult<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers = rdr.headers()?.clone();
        if headers.is_empty() || !headers[0].eq_ignore_ascii_case("date") {
            return Err(FolioError::InvalidInput {
                field: "prices".into(),
                reason: "First column must be Date".into(),
            });
        }
        let tickers: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();

        let mut dates = Vec::new();
        let mut closes = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let date = NaiveDate::parse_from_str(&record[0], DATE_FORMAT).map_err(|e| {
                FolioError::InvalidInput {
                    field: format!("prices row {}", line + 1),
                    reason: format!("Bad date '{}': {}", &record[0], e),
                }
            })?;
            let row = record
                .iter()
                .skip(1)
                .map(|cell| parse_cell(cell, line + 1))
                .collect::<FolioResult<Vec<_>>>()?;
            if row.len() != tickers.len() {
                return Err(FolioError::InvalidInput {
                    field: format!("prices row {}", line + 1),
                    reason: format!("Expected {} prices but got {}", tickers.len(), row.len()),
                });
            }
            dates.push(date);
            closes.push(row);
        }

        if dates.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FolioError::InvalidInput {
                field: "prices".into(),
                reason: "Dates must be strictly increasing".into(),
            });
        }

        Ok(Self {
            dates,
            tickers,
            closes,
        })
    }

    /// Write the frame as a `Date,<ticker>,...` CSV.
    pub fn write_csv<W: Write>(&self, writer: W) -> FolioResult<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = vec!["Date".to_string()];
        header.extend(self.tickers.iter().cloned());
        wtr.write_record(&header)?;
        for (date, row) in self.dates.iter().zip(self.closes.iter()) {
            let mut record = vec![date.format(DATE_FORMAT).to_string()];
            record.extend(row.iter().map(|c| c.map(|v| v.to_string()).unwrap_or_default()));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

fn parse_cell(cell: &str, line: usize) -> FolioResult<Option<Money>> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<Decimal>()
        .map(Some)
        .map_err(|e| FolioError::InvalidInput {
            field: format!("prices row {}", line),
            reason: format!("Bad price '{}': {}", trimmed, e),
        })
}

fn unknown_ticker(ticker: &str) -> FolioError {
    FolioError::InvalidInput {
        field: "ticker".into(),
        reason: format!("{} is not in the price frame", ticker),
    }
}
