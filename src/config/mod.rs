pub mod trade_config;

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::execution::order_builder::MissingSlTpPolicy;
use crate::ingestion::parser::BodyParamOrder;

pub use trade_config::{TradeConfig, TradeConfigRow};

/// Account ids that mean "no real account configured yet".
const PLACEHOLDER_ACCOUNTS: &[&str] = &["", "DEMO_ACCOUNT", "YOUR_ACCOUNT_ID", "CHANGE_ME"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("trade config {path}: {source}")]
    TradeConfig {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Plain orders only (A) or bracket orders for buys (B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeVersion {
    A,
    B,
}

impl TradeVersion {
    pub fn uses_brackets(&self) -> bool {
        matches!(self, TradeVersion::B)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeVersion::A => "A",
            TradeVersion::B => "B",
        }
    }
}

impl FromStr for TradeVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "A" => Ok(TradeVersion::A),
            "B" => Ok(TradeVersion::B),
            other => Err(format!("expected A or B, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    /// In-process simulated broker seeded from PAPER_POSITIONS.
    Paper,
    /// IBKR Client Portal gateway.
    Ibkr,
}

impl BrokerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerMode::Paper => "paper",
            BrokerMode::Ibkr => "ibkr",
        }
    }
}

impl FromStr for BrokerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "paper" | "demo" => Ok(BrokerMode::Paper),
            "ibkr" | "live" => Ok(BrokerMode::Ibkr),
            other => Err(format!("expected paper or ibkr, got {other}")),
        }
    }
}

/// Where the order quantity comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantitySource {
    Alert,
    Config,
}

impl FromStr for QuantitySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "alert" => Ok(QuantitySource::Alert),
            "config" => Ok(QuantitySource::Config),
            other => Err(format!("expected alert or config, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // API
    pub api_enabled: bool,
    pub host: String,
    pub port: u16,
    pub api_token: Option<String>,

    // Storage
    pub ledger_path: PathBuf,
    pub ledger_backup_keep: usize,
    pub watermark_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub spool_dir: PathBuf,

    // Trading
    pub trade_version: TradeVersion,
    pub trade_config_path: PathBuf,
    pub account: String,
    pub broker_mode: BrokerMode,
    pub missing_sl_tp_policy: MissingSlTpPolicy,
    pub body_param_order: BodyParamOrder,
    pub quantity_source: QuantitySource,
    pub price_decimals: u32,

    // Broker
    pub ibkr_base_url: String,
    pub ibkr_accept_invalid_certs: bool,
    pub paper_positions: Vec<(String, Decimal)>,
    pub broker_timeout_secs: u64,
    pub broker_max_retries: u32,
    pub broker_retry_base_ms: u64,

    // Scheduling / reconciliation
    pub poll_interval_secs: u64,
    pub reconcile_tolerance: Decimal,
    pub reconcile_every_cycle: bool,

    // Market hours
    pub market_timezone: Tz,
    pub market_open: NaiveTime,
    pub market_close: NaiveTime,

    // Notifications
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub notifications_enabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key → value source. Missing keys take defaults; malformed ones fail.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let trade_version: TradeVersion = parse_or(&get, "TRADE_VERSION", TradeVersion::A)?;
        let account = get("IBKR_ACCOUNT").unwrap_or_else(|| "DEMO_ACCOUNT".into());

        let mut broker_mode: BrokerMode = parse_or(&get, "BROKER_MODE", BrokerMode::Paper)?;
        if broker_mode == BrokerMode::Ibkr && is_placeholder_account(&account) {
            tracing::warn!(%account, "Placeholder IBKR account, falling back to paper broker");
            broker_mode = BrokerMode::Paper;
        }

        let missing_sl_tp_policy = match get("MISSING_SL_TP_POLICY") {
            None => MissingSlTpPolicy::PlainOrder,
            Some(raw) => MissingSlTpPolicy::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "MISSING_SL_TP_POLICY",
                value: raw.clone(),
                reason: "expected plain or reject".into(),
            })?,
        };

        let body_param_order = match get("BODY_SLTP_ORDER") {
            None => BodyParamOrder::TpSl,
            Some(raw) => BodyParamOrder::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "BODY_SLTP_ORDER",
                value: raw.clone(),
                reason: "expected tp_sl or sl_tp".into(),
            })?,
        };

        let market_timezone = match get("MARKET_TIMEZONE") {
            None => chrono_tz::America::Toronto,
            Some(raw) => raw.parse::<Tz>().map_err(|e| ConfigError::Invalid {
                key: "MARKET_TIMEZONE",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
        };

        let paper_positions = match get("PAPER_POSITIONS") {
            None => Vec::new(),
            Some(raw) => parse_positions(&raw).map_err(|reason| ConfigError::Invalid {
                key: "PAPER_POSITIONS",
                value: raw.clone(),
                reason,
            })?,
        };

        let trade_config_path = get("TRADE_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from(format!(
                    "config/trade_config_version_{}.csv",
                    trade_version.as_str()
                ))
            });

        Ok(Self {
            api_enabled: parse_or(&get, "API_ENABLED", true)?,
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "PORT", 8080)?,
            api_token: get("API_TOKEN"),

            ledger_path: path_or(&get, "LEDGER_PATH", "data/bot_trades.json"),
            ledger_backup_keep: parse_or(&get, "LEDGER_BACKUP_KEEP", 10)?,
            watermark_path: path_or(&get, "WATERMARK_PATH", "data/last_processed.json"),
            audit_log_path: path_or(&get, "AUDIT_LOG_PATH", "log/position_safety.jsonl"),
            spool_dir: path_or(&get, "ALERT_SPOOL_DIR", "inbox"),

            trade_version,
            trade_config_path,
            account,
            broker_mode,
            missing_sl_tp_policy,
            body_param_order,
            quantity_source: parse_or(&get, "QUANTITY_SOURCE", QuantitySource::Alert)?,
            price_decimals: parse_or(&get, "PRICE_DECIMALS", 2)?,

            ibkr_base_url: get("IBKR_BASE_URL")
                .unwrap_or_else(|| "https://localhost:5000/v1/api".into()),
            ibkr_accept_invalid_certs: parse_or(&get, "IBKR_ACCEPT_INVALID_CERTS", true)?,
            paper_positions,
            broker_timeout_secs: parse_or(&get, "BROKER_TIMEOUT_SECS", 10)?,
            broker_max_retries: parse_or(&get, "BROKER_MAX_RETRIES", 3)?,
            broker_retry_base_ms: parse_or(&get, "BROKER_RETRY_BASE_MS", 500)?,

            poll_interval_secs: parse_or(&get, "POLL_INTERVAL_SECS", 30)?,
            reconcile_tolerance: parse_or(&get, "RECONCILE_TOLERANCE", Decimal::new(1, 6))?,
            reconcile_every_cycle: parse_or(&get, "RECONCILE_EVERY_CYCLE", false)?,

            market_timezone,
            market_open: time_or(&get, "MARKET_OPEN", (9, 30))?,
            market_close: time_or(&get, "MARKET_CLOSE", (15, 59))?,

            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: get("TELEGRAM_CHAT_ID"),
            notifications_enabled: parse_or(&get, "NOTIFICATIONS_ENABLED", false)?,
        })
    }

    /// True when no real brokerage account is configured.
    pub fn is_demo(&self) -> bool {
        self.broker_mode == BrokerMode::Paper
    }

    /// Returns true if Telegram credentials are configured and notifications are on.
    pub fn has_telegram(&self) -> bool {
        self.notifications_enabled
            && self.telegram_bot_token.is_some()
            && self.telegram_chat_id.is_some()
    }
}

pub fn is_placeholder_account(account: &str) -> bool {
    PLACEHOLDER_ACCOUNTS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(account.trim()))
}

fn parse_or<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn path_or<G>(get: &G, key: &str, default: &str) -> PathBuf
where
    G: Fn(&str) -> Option<String>,
{
    get(key).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default))
}

fn time_or<G>(get: &G, key: &'static str, default: (u32, u32)) -> Result<NaiveTime, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => NaiveTime::from_hms_opt(default.0, default.1, 0).ok_or_else(|| {
            ConfigError::Invalid {
                key,
                value: format!("{:02}:{:02}", default.0, default.1),
                reason: "out of range".into(),
            }
        }),
        Some(raw) => NaiveTime::parse_from_str(&raw, "%H:%M").map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// `AAPL:10,BTCUSD:2` → `[("AAPL", 10), ("BTCUSD", 2)]`.
fn parse_positions(raw: &str) -> Result<Vec<(String, Decimal)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (ticker, qty) = pair
                .split_once(':')
                .ok_or_else(|| format!("expected TICKER:QTY, got {pair}"))?;
            let qty: Decimal = qty
                .trim()
                .parse()
                .map_err(|_| format!("bad quantity in {pair}"))?;
            if qty < Decimal::ZERO {
                return Err(format!("negative quantity in {pair}"));
            }
            Ok((ticker.trim().to_uppercase(), qty))
        })
        .collect()
}
