mod matchers;

pub use matchers::{AmazonMatcher, GenericMatcher, UberMatcher, WoolworthsMatcher};

use std::cmp::Ordering;

use tracing::debug;

use crate::core::{ExtractedEmailTransaction, RawEmail};

/// A vendor-specific receipt recognizer. `score` returns 0.0 for "not mine";
/// anything above zero enters the priority ordering, highest first.
pub trait ReceiptMatcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, email: &RawEmail) -> f32;
    fn extract(&self, email: &RawEmail) -> Option<ExtractedEmailTransaction>;
}

/// Turns raw email text into a candidate transaction, or `None` when nothing
/// recognizes the message as financial. Extraction is pure; a registry
/// instance can be shared freely across worker tasks.
pub struct Extractor {
    matchers: Vec<Box<dyn ReceiptMatcher>>,
}

impl Default for Extractor {
    fn default() -> Self {
        Extractor {
            matchers: vec![
                Box::new(UberMatcher),
                Box::new(AmazonMatcher),
                Box::new(WoolworthsMatcher),
                Box::new(GenericMatcher),
            ],
        }
    }
}

impl Extractor {
    pub fn with_matchers(matchers: Vec<Box<dyn ReceiptMatcher>>) -> Self {
        Extractor { matchers }
    }

    /// New vendors register here instead of growing a conditional chain.
    pub fn register(&mut self, matcher: Box<dyn ReceiptMatcher>) {
        self.matchers.push(matcher);
    }

    pub fn extract(&self, email: &RawEmail) -> Option<ExtractedEmailTransaction> {
        let mut scored: Vec<(f32, &Box<dyn ReceiptMatcher>)> = self
            .matchers
            .iter()
            .map(|m| (m.score(email), m))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        for (score, matcher) in scored {
            if let Some(mut tx) = matcher.extract(email) {
                if tx.merchant.trim().is_empty() {
                    tx.merchant = "Unknown Merchant".to_string();
                }
                tx.confidence = score;
                debug!(matcher = matcher.name(), score, email = %email.id, "extracted receipt");
                return Some(tx);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    pub(crate) fn uber_receipt() -> RawEmail {
        RawEmail {
            id: "msg-uber-1".to_string(),
            subject: "Your Tuesday morning trip with Uber".to_string(),
            from: "Uber Receipts <noreply@uber.com>".to_string(),
            received_at: Utc.with_ymd_and_hms(2025, 1, 7, 9, 30, 0).unwrap(),
            body: "Thanks for riding with us.\n\
                   Trip fare $23.18\n\
                   Booking fee $2.32\n\
                   Total $25.50\n\
                   Payment method: Visa ****1234\n\
                   Date: 2025-01-07\n"
                .to_string(),
        }
    }

    fn newsletter() -> RawEmail {
        RawEmail {
            id: "msg-news-1".to_string(),
            subject: "Weekly digest".to_string(),
            from: "digest@example-news.com".to_string(),
            received_at: Utc::now(),
            body: "Here is what happened this week in open source.\n".to_string(),
        }
    }

    #[test]
    fn uber_receipt_extracts_total_and_merchant() {
        let tx = Extractor::default().extract(&uber_receipt()).unwrap();

        assert_eq!(tx.merchant, "Uber");
        assert_eq!(tx.amount, "25.50");
        assert_eq!(tx.currency, "AUD");
        assert_eq!(tx.date.as_deref(), Some("2025-01-07"));
        assert_eq!(tx.payment_method.as_deref(), Some("Visa ****1234"));
        assert!(tx.confidence > 0.9);
    }

    #[test]
    fn non_financial_email_returns_none() {
        assert!(Extractor::default().extract(&newsletter()).is_none());
    }

    #[test]
    fn vendor_matcher_outranks_generic_fallback() {
        struct EagerGeneric;

        impl ReceiptMatcher for EagerGeneric {
            fn name(&self) -> &'static str {
                "eager"
            }
            fn score(&self, _: &RawEmail) -> f32 {
                0.5
            }
            fn extract(&self, email: &RawEmail) -> Option<ExtractedEmailTransaction> {
                GenericMatcher.extract(email).map(|mut tx| {
                    tx.merchant = "Wrong".to_string();
                    tx
                })
            }
        }

        let extractor =
            Extractor::with_matchers(vec![Box::new(EagerGeneric), Box::new(UberMatcher)]);
        let tx = extractor.extract(&uber_receipt()).unwrap();

        assert_eq!(tx.merchant, "Uber");
    }

    #[test]
    fn registered_matcher_joins_the_priority_order() {
        struct JbHifi;

        impl ReceiptMatcher for JbHifi {
            fn name(&self) -> &'static str {
                "jbhifi"
            }
            fn score(&self, email: &RawEmail) -> f32 {
                if email.from.contains("jbhifi.com.au") {
                    0.9
                } else {
                    0.0
                }
            }
            fn extract(&self, email: &RawEmail) -> Option<ExtractedEmailTransaction> {
                GenericMatcher.extract(email).map(|mut tx| {
                    tx.merchant = "JB Hi-Fi".to_string();
                    tx
                })
            }
        }

        let mut extractor = Extractor::default();
        extractor.register(Box::new(JbHifi));

        let mut mail = uber_receipt();
        mail.from = "JB Hi-Fi <orders@jbhifi.com.au>".to_string();
        mail.subject = "Your JB Hi-Fi tax invoice".to_string();
        let tx = extractor.extract(&mail).unwrap();

        // The new vendor outranks the generic fallback without touching the
        // built-in registry.
        assert_eq!(tx.merchant, "JB Hi-Fi");
        assert_eq!(tx.amount, "25.50");
    }

    #[test]
    fn blank_merchant_falls_back_to_unknown() {
        struct Blank;

        impl ReceiptMatcher for Blank {
            fn name(&self) -> &'static str {
                "blank"
            }
            fn score(&self, _: &RawEmail) -> f32 {
                1.0
            }
            fn extract(&self, email: &RawEmail) -> Option<ExtractedEmailTransaction> {
                GenericMatcher.extract(email).map(|mut tx| {
                    tx.merchant = "  ".to_string();
                    tx
                })
            }
        }

        let extractor = Extractor::with_matchers(vec![Box::new(Blank)]);
        let tx = extractor.extract(&uber_receipt()).unwrap();

        assert_eq!(tx.merchant, "Unknown Merchant");
    }
}
