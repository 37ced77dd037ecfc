mod candidate;
mod txn;

pub use candidate::{Candidate, ExtractedEmailTransaction, LineItemDraft, RawBankTransaction, RawEmail};
pub use txn::{CanonicalTransaction, LineItem, SourceType, TaxCategory, TransactionEntry};
