//! Typed snapshots of accounting entities and derived customer totals
//!
//! Money is held in minor units (cents). Never float.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Entity types the engine reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Invoice,
    Payment,
    CreditMemo,
}

impl EntityKind {
    /// Collection name under a customer scope in the document store
    pub fn collection(self) -> &'static str {
        match self {
            EntityKind::Invoice => "invoices",
            EntityKind::Payment => "payments",
            EntityKind::CreditMemo => "credit_memos",
        }
    }

    /// Path segment of the QuickBooks read endpoint
    pub fn api_segment(self) -> &'static str {
        match self {
            EntityKind::Invoice => "invoice",
            EntityKind::Payment => "payment",
            EntityKind::CreditMemo => "creditmemo",
        }
    }

    /// Key wrapping the entity in a QuickBooks read response
    pub fn response_key(self) -> &'static str {
        match self {
            EntityKind::Invoice => "Invoice",
            EntityKind::Payment => "Payment",
            EntityKind::CreditMemo => "CreditMemo",
        }
    }

    /// Document field holding the entity ID
    pub fn id_field(self) -> &'static str {
        match self {
            EntityKind::Invoice => "invoice_id",
            EntityKind::Payment => "payment_id",
            EntityKind::CreditMemo => "credit_memo_id",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.response_key())
    }
}

/// A record the store can persist under a customer scope
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

/// Snapshot of an invoice as last fetched from QuickBooks
///
/// `balance_cents` and `hours_purchased` both absent means the invoice was voided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub invoice_id: String,
    pub doc_number: Option<String>,
    pub customer_ref: String,
    pub bill_email: Option<String>,
    pub created_time: String,
    pub last_updated: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours_purchased: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl InvoiceRecord {
    pub fn is_voided(&self) -> bool {
        self.balance_cents.is_none() && self.hours_purchased.is_none()
    }
}

impl Record for InvoiceRecord {
    const KIND: EntityKind = EntityKind::Invoice;

    fn id(&self) -> &str {
        &self.invoice_id
    }
}

/// Amount of a payment or credit memo applied to one invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineApplication {
    pub invoice_id: String,
    pub applied_amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub created_at: String,
    pub total_amount_cents: i64,
    pub payment_method: Option<String>,
    pub lines: Vec<LineApplication>,
    pub tenant_id: String,
}

impl PaymentRecord {
    /// Zero-total payments apply existing credit rather than move cash
    pub fn is_zero_total(&self) -> bool {
        self.total_amount_cents == 0
    }

    pub fn first_invoice_id(&self) -> Option<&str> {
        self.lines.first().map(|line| line.invoice_id.as_str())
    }
}

impl Record for PaymentRecord {
    const KIND: EntityKind = EntityKind::Payment;

    fn id(&self) -> &str {
        &self.payment_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditMemoRecord {
    pub credit_memo_id: String,
    pub lines: Vec<LineApplication>,
    pub tenant_id: String,
}

impl CreditMemoRecord {
    pub fn first_invoice_id(&self) -> Option<&str> {
        self.lines.first().map(|line| line.invoice_id.as_str())
    }
}

impl Record for CreditMemoRecord {
    const KIND: EntityKind = EntityKind::CreditMemo;

    fn id(&self) -> &str {
        &self.credit_memo_id
    }
}

/// Per-customer totals derived from stored invoices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerAggregate {
    pub customer_ref: String,
    pub total_balance_cents: i64,
    pub total_hours: f64,
    pub invoice_count: usize,
}

impl CustomerAggregate {
    /// Sum invoices, counting absent balance/hours as zero
    pub fn from_invoices<'a>(
        customer_ref: &str,
        invoices: impl IntoIterator<Item = &'a InvoiceRecord>,
    ) -> Self {
        let mut aggregate = CustomerAggregate {
            customer_ref: customer_ref.to_string(),
            total_balance_cents: 0,
            total_hours: 0.0,
            invoice_count: 0,
        };

        for invoice in invoices {
            aggregate.total_balance_cents += invoice.balance_cents.unwrap_or(0);
            aggregate.total_hours += invoice.hours_purchased.unwrap_or(0.0);
            aggregate.invoice_count += 1;
        }

        aggregate
    }
}

/// Exponents beyond this cannot describe an amount that fits in cents
const MAX_EXPONENT: i64 = 400;

/// Convert a decimal amount string into minor units with integer math
///
/// Accepts plain decimals and the exponent form JSON serializers emit for
/// very large or very small floats (`1e16`, `2.5E-7`). Digits past the second
/// decimal place are rounded half away from zero.
pub fn parse_minor_units(s: &str) -> Result<i64, String> {
    let original = s.trim();
    let (negative, s) = match original.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, original),
    };
    if s.is_empty() {
        return Err("empty amount".to_string());
    }

    let (mantissa, exponent) = match s.find(['e', 'E']) {
        Some(at) => {
            let exponent: i64 = s[at + 1..]
                .parse()
                .map_err(|e| format!("bad exponent in {}: {}", original, e))?;
            if exponent.abs() > MAX_EXPONENT {
                return Err(format!("amount out of range: {}", original));
            }
            (&s[..at], exponent)
        }
        None => (s, 0),
    };

    let (whole, frac) = match mantissa.find('.') {
        Some(dot) => (&mantissa[..dot], &mantissa[dot + 1..]),
        None => (mantissa, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(format!("bad amount: {}", original));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("bad amount: {}", original));
    }
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("bad cents: {}", original));
    }

    let (whole, frac) = shift_decimal_point(whole, frac, exponent);
    let (whole, frac) = (whole.as_str(), frac.as_str());

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| format!("amount out of range: {}", original))?
    };

    let digits: Vec<i64> = frac.bytes().map(|b| i64::from(b - b'0')).collect();
    let mut cents = digits.first().copied().unwrap_or(0) * 10 + digits.get(1).copied().unwrap_or(0);
    if digits.get(2).copied().unwrap_or(0) >= 5 {
        cents += 1;
    }

    let minor = whole
        .checked_mul(100)
        .and_then(|w| w.checked_add(cents))
        .ok_or_else(|| format!("amount out of range: {}", original))?;
    Ok(if negative { -minor } else { minor })
}

/// Move the decimal point of `whole.frac` by `exponent` places
fn shift_decimal_point(whole: &str, frac: &str, exponent: i64) -> (String, String) {
    if exponent == 0 {
        return (whole.to_string(), frac.to_string());
    }

    let digits = format!("{}{}", whole, frac);
    let point = whole.len() as i64 + exponent;
    if point <= 0 {
        let zeros = "0".repeat(point.unsigned_abs() as usize);
        (String::new(), format!("{}{}", zeros, digits))
    } else if point as usize >= digits.len() {
        let zeros = "0".repeat(point as usize - digits.len());
        (format!("{}{}", digits, zeros), String::new())
    } else {
        let (w, f) = digits.split_at(point as usize);
        (w.to_string(), f.to_string())
    }
}
