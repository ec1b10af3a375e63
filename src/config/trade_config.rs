//! Per-account trade sizing table (`config/trade_config_version_{A,B}.csv`).
//!
//! Columns: `ibkr_account,ticker,price,quantity`. `price` is informational and may be blank.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use rust_decimal::Decimal;
use serde::Deserialize;

use super::ConfigError;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TradeConfigRow {
    pub ibkr_account: String,
    pub ticker: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub quantity: Decimal,
}

/// Rows for a single account, keyed by upper-cased ticker.
#[derive(Debug, Clone, Default)]
pub struct TradeConfig {
    rows: HashMap<String, TradeConfigRow>,
}

impl TradeConfig {
    pub fn load(path: &Path, account: &str) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).map_err(|e| ConfigError::TradeConfig {
            path: path.display().to_string(),
            source: e.into(),
        })?;
        Self::from_reader(file, account).map_err(|source| ConfigError::TradeConfig {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_reader<R: Read>(reader: R, account: &str) -> Result<Self, csv::Error> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut rows = HashMap::new();
        for record in rdr.deserialize::<TradeConfigRow>() {
            let row = record?;
            if row.ibkr_account != account {
                continue;
            }
            let key = row.ticker.to_uppercase();
            if rows.contains_key(&key) {
                tracing::warn!(ticker = %key, %account, "Duplicate trade config row, keeping first");
                continue;
            }
            rows.insert(key, row);
        }
        tracing::info!(%account, tickers = rows.len(), "Loaded trade config");
        Ok(Self { rows })
    }

    pub fn quantity_for(&self, ticker: &str) -> Option<Decimal> {
        self.rows.get(&ticker.to_uppercase()).map(|r| r.quantity)
    }

    pub fn tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self.rows.keys().cloned().collect();
        tickers.sort();
        tickers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const CSV: &str = "ibkr_account,ticker,price,quantity\n\
                       U111,AAPL,,10\n\
                       U111,btcusd,100000,2\n\
                       U222,AAPL,190,99\n";

    #[test]
    fn test_filters_by_account() {
        let config = TradeConfig::from_reader(CSV.as_bytes(), "U111").unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config.quantity_for("AAPL"), Some(dec!(10)));
        assert_eq!(config.quantity_for("BTCUSD"), Some(dec!(2)));
        assert_eq!(config.tickers(), vec!["AAPL".to_string(), "BTCUSD".to_string()]);
    }

    #[test]
    fn test_unknown_ticker() {
        let config = TradeConfig::from_reader(CSV.as_bytes(), "U222").unwrap();
        assert_eq!(config.quantity_for("AAPL"), Some(dec!(99)));
        assert_eq!(config.quantity_for("TSLA"), None);
    }

    #[test]
    fn test_bad_quantity_is_error() {
        let csv = "ibkr_account,ticker,price,quantity\nU111,AAPL,,lots\n";
        assert!(TradeConfig::from_reader(csv.as_bytes(), "U111").is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TradeConfig::load(&dir.path().join("nope.csv"), "U111").unwrap_err();
        assert!(matches!(err, ConfigError::TradeConfig { .. }));
    }
}
