use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One raw alert as delivered by the message source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMessage {
    /// Source-assigned identity (spool file name, mail Message-ID).
    #[serde(default)]
    pub id: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl AlertMessage {
    /// Short `subject | body` excerpt kept on ledger entries for traceability.
    pub fn excerpt(&self) -> String {
        let subject: String = self.subject.chars().take(50).collect();
        let body: String = self.body.chars().take(50).collect();
        format!("Subject: {subject}... | Body: {body}...")
    }
}
