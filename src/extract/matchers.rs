use lazy_static::lazy_static;
use regex::Regex;

use crate::core::{ExtractedEmailTransaction, LineItemDraft, RawEmail};

use super::ReceiptMatcher;

lazy_static! {
    static ref AMOUNT_RE: Regex = Regex::new(r"\$\s*([0-9][0-9,]*\.[0-9]{2})").unwrap();
    static ref TOTAL_KEYWORD_RE: Regex =
        Regex::new(r"(?i)\b(total|amount due|amount paid|amount charged|you paid)\b").unwrap();
    static ref DATE_RE: Regex = Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap();
    static ref FINANCIAL_MARKER_RE: Regex = Regex::new(
        r"(?i)\b(tax invoice|receipt|invoice|order confirmation|payment received|trip fare)\b"
    )
    .unwrap();
    static ref ABN_RE: Regex =
        Regex::new(r"(?i)\bABN:?\s*(\d{2}\s?\d{3}\s?\d{3}\s?\d{3})\b").unwrap();
    static ref GST_RE: Regex =
        Regex::new(r"(?i)\bGST[^$\n]*\$\s*([0-9][0-9,]*\.[0-9]{2})").unwrap();
    static ref INVOICE_NO_RE: Regex =
        Regex::new(r"(?i)\b(?:invoice|receipt)\s*(?:no\.?|number|#)\s*:?\s*([A-Za-z0-9][A-Za-z0-9-]*)")
            .unwrap();
    static ref PAYMENT_RE: Regex =
        Regex::new(r"(?i)\b(?:paid with|payment method|charged to)\s*:?\s*([^\n]+)").unwrap();
    static ref LINE_ITEM_RE: Regex =
        Regex::new(r"(?m)^\s*(.+?)\s+(?:x\s*(\d+)\s+)?\$([0-9][0-9,]*\.[0-9]{2})\s*$").unwrap();
    static ref ITEM_EXCLUDE_RE: Regex =
        Regex::new(r"(?i)\b(total|subtotal|gst|tax|fee|balance|discount)\b").unwrap();
    static ref SENDER_NAME_RE: Regex = Regex::new(r#"^\s*"?([^"<@]+?)"?\s*<"#).unwrap();
    static ref SENDER_DOMAIN_RE: Regex = Regex::new(r"@([A-Za-z0-9-]+)").unwrap();
}

/// Picks the amount adjacent to a total keyword, falling back to the largest
/// amount in the message.
fn best_amount(body: &str) -> Option<String> {
    for line in body.lines() {
        if TOTAL_KEYWORD_RE.is_match(line) {
            if let Some(caps) = AMOUNT_RE.captures(line) {
                return Some(caps[1].replace(',', ""));
            }
        }
    }

    AMOUNT_RE
        .captures_iter(body)
        .map(|caps| caps[1].replace(',', ""))
        .max_by(|a, b| {
            let a = a.parse::<f64>().unwrap_or(0.0);
            let b = b.parse::<f64>().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
        })
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text).map(|caps| caps[1].trim().to_string())
}

/// Pairs description lines with their adjacent price token. Summary lines
/// (totals, GST, fees) are not items.
fn line_items(body: &str) -> Vec<LineItemDraft> {
    LINE_ITEM_RE
        .captures_iter(body)
        .filter(|caps| !ITEM_EXCLUDE_RE.is_match(&caps[1]))
        .map(|caps| LineItemDraft {
            description: caps[1].trim().to_string(),
            quantity: caps
                .get(2)
                .and_then(|q| q.as_str().parse().ok())
                .unwrap_or(1),
            unit_price: caps[3].replace(',', ""),
        })
        .collect()
}

/// The shared field harvest every matcher builds on. Returns `None` when no
/// dollar amount is present at all.
fn harvest(email: &RawEmail, merchant: &str) -> Option<ExtractedEmailTransaction> {
    let amount = best_amount(&email.body)?;

    Some(ExtractedEmailTransaction {
        email_id: email.id.clone(),
        merchant: merchant.to_string(),
        amount,
        currency: "AUD".to_string(),
        date: first_capture(&DATE_RE, &email.body),
        gst_amount: first_capture(&GST_RE, &email.body),
        abn: first_capture(&ABN_RE, &email.body),
        invoice_number: first_capture(&INVOICE_NO_RE, &email.body),
        payment_method: first_capture(&PAYMENT_RE, &email.body),
        items: line_items(&email.body),
        confidence: 0.0,
        subject: email.subject.clone(),
        from: email.from.clone(),
        received_at: email.received_at,
    })
}

fn sender_merchant(from: &str) -> String {
    if let Some(name) = first_capture(&SENDER_NAME_RE, from) {
        return name;
    }
    if let Some(domain) = first_capture(&SENDER_DOMAIN_RE, from) {
        let mut chars = domain.chars();
        return match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => String::new(),
        };
    }

    String::new()
}

pub struct UberMatcher;

impl ReceiptMatcher for UberMatcher {
    fn name(&self) -> &'static str {
        "uber"
    }

    fn score(&self, email: &RawEmail) -> f32 {
        if email.from.contains("@uber.com") {
            0.95
        } else if email.subject.to_lowercase().contains("trip with uber") {
            0.9
        } else {
            0.0
        }
    }

    fn extract(&self, email: &RawEmail) -> Option<ExtractedEmailTransaction> {
        harvest(email, "Uber")
    }
}

pub struct AmazonMatcher;

impl ReceiptMatcher for AmazonMatcher {
    fn name(&self) -> &'static str {
        "amazon"
    }

    fn score(&self, email: &RawEmail) -> f32 {
        if email.from.contains("amazon.com.au") {
            0.9
        } else {
            0.0
        }
    }

    fn extract(&self, email: &RawEmail) -> Option<ExtractedEmailTransaction> {
        harvest(email, "Amazon AU")
    }
}

pub struct WoolworthsMatcher;

impl ReceiptMatcher for WoolworthsMatcher {
    fn name(&self) -> &'static str {
        "woolworths"
    }

    fn score(&self, email: &RawEmail) -> f32 {
        if email.from.to_lowercase().contains("woolworths") {
            0.9
        } else {
            0.0
        }
    }

    fn extract(&self, email: &RawEmail) -> Option<ExtractedEmailTransaction> {
        harvest(email, "Woolworths")
    }
}

/// Heuristic fallback: a currency amount plus a receipt/invoice marker is
/// treated as financial, with the sender as merchant.
pub struct GenericMatcher;

impl ReceiptMatcher for GenericMatcher {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn score(&self, email: &RawEmail) -> f32 {
        let haystack = format!("{}\n{}", email.subject, email.body);
        if AMOUNT_RE.is_match(&email.body) && FINANCIAL_MARKER_RE.is_match(&haystack) {
            0.4
        } else {
            0.0
        }
    }

    fn extract(&self, email: &RawEmail) -> Option<ExtractedEmailTransaction> {
        harvest(email, &sender_merchant(&email.from))
    }
}
