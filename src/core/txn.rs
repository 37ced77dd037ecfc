use chrono::naive::NaiveDate;
use rusty_money::{iso::Currency, Money};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Bank,
    Email,
}

impl ToString for SourceType {
    fn to_string(&self) -> String {
        match self {
            SourceType::Bank => "BANK",
            SourceType::Email => "EMAIL",
        }
        .to_string()
    }
}

impl TryFrom<&str> for SourceType {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "BANK" => Ok(SourceType::Bank),
            "EMAIL" => Ok(SourceType::Email),
            s => Err(anyhow::anyhow!("unknown source type {}", s)),
        }
    }
}

/// Every committed transaction carries a category; unmatched merchants fall
/// back to `Personal` rather than leaving the field unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxCategory {
    Business,
    Personal,
    Investment,
}

impl ToString for TaxCategory {
    fn to_string(&self) -> String {
        match self {
            TaxCategory::Business => "BUSINESS",
            TaxCategory::Personal => "PERSONAL",
            TaxCategory::Investment => "INVESTMENT",
        }
        .to_string()
    }
}

impl TryFrom<&str> for TaxCategory {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "BUSINESS" => Ok(TaxCategory::Business),
            "PERSONAL" => Ok(TaxCategory::Personal),
            "INVESTMENT" => Ok(TaxCategory::Investment),
            s => Err(anyhow::anyhow!("unknown tax category {}", s)),
        }
    }
}

/// Canonical ledger record. Immutable once committed; corrections are
/// updates against the stored row, never a re-import.
#[derive(Debug, Clone)]
pub struct CanonicalTransaction {
    pub id: Ulid,
    pub date: NaiveDate,
    pub merchant: String,
    pub amount: Money<'static, Currency>,
    pub tax_category: TaxCategory,
    pub source: SourceType,
    /// Upstream identifier, unique within its source. The duplicate filter
    /// and a database unique index both key on this.
    pub external_id: String,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    pub unit_price: Money<'static, Currency>,
}

/// A canonical transaction together with its line items, ready for a batch
/// commit. The source payload is stored alongside the canonical row for
/// audit and re-normalization.
#[derive(Debug, Clone)]
pub struct TransactionEntry {
    pub canonical: CanonicalTransaction,
    pub items: Vec<LineItem>,
    pub source_payload: serde_json::Value,
}

impl TransactionEntry {
    pub fn external_id(&self) -> &str {
        &self.canonical.external_id
    }
}
