use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Transaction as returned by the aggregator, before normalization. Never
/// persisted directly; the original payload rides along for the `source`
/// column of the committed row.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBankTransaction {
    pub external_id: String,
    pub connection_id: String,
    pub posted_at: String,
    pub amount: String,
    pub currency: Option<String>,
    pub description: String,
    pub raw_payload: serde_json::Value,
}

/// A message pulled from the mailbox provider, body already decoded to text.
#[derive(Debug, Clone)]
pub struct RawEmail {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub received_at: DateTime<Utc>,
    pub body: String,
}

/// Candidate produced by the receipt extractor. Amounts stay as decimal
/// strings until normalization so a bad parse is reported against the
/// candidate, not swallowed during extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEmailTransaction {
    pub email_id: String,
    pub merchant: String,
    pub amount: String,
    pub currency: String,
    pub date: Option<String>,
    pub gst_amount: Option<String>,
    pub abn: Option<String>,
    pub invoice_number: Option<String>,
    pub payment_method: Option<String>,
    pub items: Vec<LineItemDraft>,
    pub confidence: f32,
    pub subject: String,
    pub from: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineItemDraft {
    pub description: String,
    pub quantity: u32,
    pub unit_price: String,
}

#[derive(Debug, Clone)]
pub enum Candidate {
    Bank(RawBankTransaction),
    Email(ExtractedEmailTransaction),
}

impl Candidate {
    pub fn external_id(&self) -> &str {
        match self {
            Candidate::Bank(tx) => &tx.external_id,
            Candidate::Email(tx) => &tx.email_id,
        }
    }
}
