use serde_json::json;

use crate::execution::Decision;
use crate::execution::ReconcileReport;
use crate::ledger::LoadSource;
use crate::models::{OrderRequest, TradeSignal};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Telegram notification service. Failures are logged but never block the main flow.
#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self::with_api_base(TELEGRAM_API, bot_token, chat_id)
    }

    pub fn with_api_base(api_base: impl Into<String>, bot_token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            bot_token,
            chat_id,
        }
    }

    /// Send a Telegram message. Failures are logged as warnings.
    pub async fn send(&self, message: &str) {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);

        let body = json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "Markdown",
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    tracing::warn!(
                        status = %resp.status(),
                        "Telegram sendMessage returned non-2xx"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send Telegram notification");
            }
        }
    }

    /// Fire-and-forget: the trading loop never waits on Telegram.
    pub fn spawn_send(&self, message: String) {
        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.send(&message).await;
        });
    }
}

pub fn format_order_placed(
    signal: &TradeSignal,
    request: &OrderRequest,
    order_id: &str,
    demo: bool,
) -> String {
    let mode = if demo { "DEMO" } else { "LIVE" };
    let mut msg = format!(
        "*[{mode}] Order placed* (id: `{order_id}`)\n{} {} x{}\nType: {} triggered at ${}",
        request.side(),
        request.ticker(),
        request.quantity(),
        request.order_type(),
        signal.price,
    );
    if let OrderRequest::Bracket(b) = request {
        if let (Some(tp), Some(sl)) = (b.take_profit_price(), b.stop_loss_price()) {
            msg.push_str(&format!("\nTP: ${tp}, SL: ${sl}"));
        }
    }
    msg
}

pub fn format_blocked(signal: &TradeSignal, decision: &Decision) -> String {
    format!(
        "*Sell blocked* ({})\n{} {} x{}\n{}",
        decision.reason, signal.action, signal.ticker, signal.quantity, decision.message,
    )
}

pub fn format_failure(ticker: &str, reason: &str, detail: &str) -> String {
    format!("*Trade failed* ({reason})\nTicker: {ticker}\n{detail}")
}

pub fn format_ledger_load(source: &LoadSource) -> Option<String> {
    match source {
        LoadSource::Backup(path) => Some(format!(
            "*Ledger recovered from backup*\n`{}`",
            path.display()
        )),
        LoadSource::Unrecoverable => Some(
            "*Ledger unrecoverable*\nStarted empty in safe mode. All sells are blocked until a buy is recorded or an operator clears safe mode."
                .to_string(),
        ),
        LoadSource::Fresh | LoadSource::Primary => None,
    }
}

pub fn format_reconcile(report: &ReconcileReport) -> Option<String> {
    if report.mismatches.is_empty() {
        return None;
    }
    let lines: Vec<String> = report.mismatches.iter().map(|m| format!("- {m}")).collect();
    Some(format!(
        "*Position mismatches* ({})\n{}\nManual review required; nothing was changed.",
        report.mismatches.len(),
        lines.join("\n")
    ))
}
