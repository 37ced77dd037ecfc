use chrono::naive::NaiveDate;
use chrono::{DateTime, Utc};
use rusty_money::{iso, iso::Currency, Money};
use thiserror::Error;
use tracing::debug;
use ulid::Ulid;

use crate::core::{
    Candidate, CanonicalTransaction, ExtractedEmailTransaction, LineItem, RawBankTransaction,
    SourceType, TaxCategory, TransactionEntry,
};

pub const NOTE_DELIMITER: &str = " | ";

/// Appended to the note when every date format fails and "now" is used.
pub const LOW_CONFIDENCE_DATE_MARKER: &str = "date unverified";

const CATEGORY_KEYWORDS: &[(&str, TaxCategory)] = &[
    ("hardware", TaxCategory::Business),
    ("software", TaxCategory::Business),
    ("hosting", TaxCategory::Business),
    ("office", TaxCategory::Business),
    ("stationery", TaxCategory::Business),
    ("groceries", TaxCategory::Personal),
    ("supermarket", TaxCategory::Personal),
    ("restaurant", TaxCategory::Personal),
    ("uber", TaxCategory::Personal),
    ("stock", TaxCategory::Investment),
    ("brokerage", TaxCategory::Investment),
    ("dividend", TaxCategory::Investment),
    ("etf", TaxCategory::Investment),
];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unparseable amount {amount:?} on candidate {external_id}")]
    BadAmount { external_id: String, amount: String },
    #[error("unknown currency code {code:?} on candidate {external_id}")]
    UnknownCurrency { external_id: String, code: String },
}

/// Maps either source's candidate into a canonical transaction plus line
/// items. All rules are deterministic; the only failure mode is an amount or
/// currency that cannot be decoded.
pub struct Normalizer {
    default_currency: &'static Currency,
}

impl Default for Normalizer {
    fn default() -> Self {
        Normalizer {
            default_currency: iso::AUD,
        }
    }
}

impl Normalizer {
    pub fn build(&self, candidate: &Candidate) -> Result<TransactionEntry, NormalizeError> {
        match candidate {
            Candidate::Bank(tx) => self.from_bank(tx),
            Candidate::Email(tx) => self.from_email(tx),
        }
    }

    fn from_bank(&self, tx: &RawBankTransaction) -> Result<TransactionEntry, NormalizeError> {
        let currency = self.currency(tx.currency.as_deref(), &tx.external_id)?;
        let amount = parse_money(&tx.amount, currency, &tx.external_id)?;
        let (date, confident) = parse_date(&tx.posted_at, Utc::now());

        let merchant = if tx.description.trim().is_empty() {
            "Unknown Merchant".to_string()
        } else {
            tx.description.trim().to_string()
        };

        let mut note_fields = vec![tx.description.trim().to_string()];
        if !confident {
            note_fields.push(LOW_CONFIDENCE_DATE_MARKER.to_string());
        }

        Ok(TransactionEntry {
            canonical: CanonicalTransaction {
                id: Ulid::new(),
                date,
                tax_category: assign_category(&merchant),
                merchant,
                amount,
                source: SourceType::Bank,
                external_id: tx.external_id.clone(),
                note: note_fields.join(NOTE_DELIMITER),
            },
            items: vec![],
            source_payload: tx.raw_payload.clone(),
        })
    }

    fn from_email(&self, tx: &ExtractedEmailTransaction) -> Result<TransactionEntry, NormalizeError> {
        let currency = self.currency(Some(&tx.currency), &tx.email_id)?;
        let amount = parse_money(&tx.amount, currency, &tx.email_id)?;

        // Missing date falls back to the message's received timestamp, which
        // is always available and counts as confident.
        let (date, confident) = match &tx.date {
            Some(raw) => parse_date(raw, tx.received_at),
            None => (tx.received_at.date_naive(), true),
        };

        let merchant = if tx.merchant.trim().is_empty() {
            "Unknown Merchant".to_string()
        } else {
            tx.merchant.trim().to_string()
        };

        let mut items = Vec::with_capacity(tx.items.len());
        for draft in &tx.items {
            items.push(LineItem {
                description: draft.description.clone(),
                quantity: draft.quantity,
                unit_price: parse_money(&draft.unit_price, currency, &tx.email_id)?,
            });
        }

        Ok(TransactionEntry {
            canonical: CanonicalTransaction {
                id: Ulid::new(),
                date,
                tax_category: assign_category(&merchant),
                merchant,
                amount,
                source: SourceType::Email,
                external_id: tx.email_id.clone(),
                note: compose_note(tx, confident),
            },
            items,
            source_payload: serde_json::json!({
                "emailId": tx.email_id,
                "subject": tx.subject,
                "from": tx.from,
                "receivedAt": tx.received_at.to_rfc3339(),
            }),
        })
    }

    fn currency(
        &self,
        code: Option<&str>,
        external_id: &str,
    ) -> Result<&'static Currency, NormalizeError> {
        match code {
            None => Ok(self.default_currency),
            Some(code) => iso::find(code).ok_or_else(|| NormalizeError::UnknownCurrency {
                external_id: external_id.to_string(),
                code: code.to_string(),
            }),
        }
    }
}

fn parse_money(
    raw: &str,
    currency: &'static Currency,
    external_id: &str,
) -> Result<Money<'static, Currency>, NormalizeError> {
    Money::from_str(raw, currency).map_err(|_| NormalizeError::BadAmount {
        external_id: external_id.to_string(),
        amount: raw.to_string(),
    })
}

/// Date parsing tries ISO-8601, then the short form, then a Unix timestamp.
/// When everything fails the fallback timestamp is used and the result is
/// flagged low-confidence instead of raising.
pub fn parse_date(raw: &str, fallback: DateTime<Utc>) -> (NaiveDate, bool) {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return (dt.with_timezone(&Utc).date_naive(), true);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return (date, true);
    }
    if let Ok(secs) = raw.parse::<i64>() {
        if let Some(dt) = DateTime::from_timestamp(secs, 0) {
            return (dt.date_naive(), true);
        }
    }

    debug!(%raw, "all date formats failed, using fallback");
    (fallback.date_naive(), false)
}

/// Keyword lookup over the merchant text. Unmatched merchants are `Personal`,
/// never unset.
pub fn assign_category(merchant: &str) -> TaxCategory {
    let haystack = merchant.to_lowercase();

    CATEGORY_KEYWORDS
        .iter()
        .find(|(keyword, _)| haystack.contains(keyword))
        .map(|(_, category)| *category)
        .unwrap_or(TaxCategory::Personal)
}

/// Note text built from fixed fields in a fixed order so the result is
/// deterministic: subject, sender, confidence, GST, ABN, invoice number,
/// payment method.
fn compose_note(tx: &ExtractedEmailTransaction, date_confident: bool) -> String {
    let mut fields = vec![
        tx.subject.clone(),
        tx.from.clone(),
        format!("confidence {:.0}%", tx.confidence * 100.0),
    ];

    if let Some(gst) = &tx.gst_amount {
        fields.push(format!("GST {}", gst));
    }
    if let Some(abn) = &tx.abn {
        fields.push(format!("ABN {}", abn));
    }
    if let Some(invoice) = &tx.invoice_number {
        fields.push(format!("invoice {}", invoice));
    }
    if let Some(method) = &tx.payment_method {
        fields.push(method.clone());
    }
    if !date_confident {
        fields.push(LOW_CONFIDENCE_DATE_MARKER.to_string());
    }

    fields.join(NOTE_DELIMITER)
}
