//! Transaction Management (TM) collaborator.
//!
//! The TM service is the system of record for transactions, reviews, and
//! matched rules. This module defines the typed interface the context tool
//! consumes, the field-name translation from the TM wire format to the
//! internal names used by scoring logic, and the HTTP client with retry,
//! circuit breaking, and M2M token caching.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::state::Transaction;

pub mod http;

pub use http::HttpTmClient;

/// The overview bundle for one transaction: a single TM call returning the
/// transaction plus its review, notes, case, and matched rules.
#[derive(Debug, Clone)]
pub struct TmOverview {
    /// The transaction, after field translation.
    pub transaction: Transaction,
    /// Open review, if any.
    pub review: Option<Value>,
    /// Analyst notes.
    pub notes: Vec<Value>,
    /// Linked case, if any.
    pub case: Option<Value>,
    /// Fraud rules matched at authorization time.
    pub matched_rules: Vec<Value>,
}

/// Errors from the TM collaborator.
#[derive(Debug, Error)]
pub enum TmError {
    /// HTTP transport failure.
    #[error("tm request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Upstream responded with a non-success status.
    #[error("tm returned status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
    /// The circuit breaker is open; the call was not attempted.
    #[error("tm circuit breaker is open")]
    CircuitOpen,
    /// M2M token exchange failed.
    #[error("tm auth failed: {0}")]
    Auth(String),
    /// A wire payload could not be translated to internal types.
    #[error("tm field translation failed: {0}")]
    Translation(String),
}

/// Transaction Management API surface consumed by the context tool.
#[async_trait]
pub trait TmApi: Send + Sync {
    /// Fetch the overview bundle for a transaction.
    async fn overview(
        &self,
        transaction_id: &str,
        include_rules: bool,
    ) -> Result<TmOverview, TmError>;

    /// Fetch card activity over the look-back window, auto-paginating up
    /// to `max_pages`.
    async fn card_history(
        &self,
        card_id: &str,
        hours_back: u32,
        max_pages: u32,
    ) -> Result<Vec<Transaction>, TmError>;

    /// Fetch merchant activity over the look-back window, auto-paginating
    /// up to `max_pages`.
    async fn merchant_history(
        &self,
        merchant_id: &str,
        hours_back: u32,
        max_pages: u32,
    ) -> Result<Vec<Transaction>, TmError>;

    /// Whether the TM service is reachable and healthy.
    async fn health(&self) -> bool;
}

// ── Field translation ───────────────────────────────────────────

/// Static translation table from TM wire field names to internal names.
///
/// Kept as data so the mapping is reviewable in one place; the
/// [`translate_transaction`] function applies it.
pub const FIELD_TRANSLATION: [(&str, &str); 11] = [
    ("txn_id", "transaction_id"),
    ("card_token", "card_id"),
    ("merchant_ref", "merchant_id"),
    ("merchant_descriptor", "merchant_name"),
    ("mcc_code", "mcc"),
    ("amount_minor", "amount"),
    ("currency_code", "currency"),
    ("disposition", "outcome"),
    ("secure_3ds", "three_ds_verified"),
    ("device_trust", "device_trusted"),
    ("occurred_at", "occurred_at"),
];

/// Translate a raw TM transaction payload into the internal
/// [`Transaction`] shape.
///
/// Amounts arrive in minor units and are converted to major units.
/// Missing optional fields default; missing required fields are errors.
pub fn translate_transaction(raw: &Value) -> Result<Transaction, TmError> {
    let transaction_id = required_str(raw, "txn_id")?;
    let card_id = required_str(raw, "card_token")?;
    let merchant_id = required_str(raw, "merchant_ref")?;

    let amount_minor = raw
        .get("amount_minor")
        .and_then(Value::as_i64)
        .ok_or_else(|| TmError::Translation("missing or non-integer amount_minor".to_owned()))?;
    let amount = to_major_units(amount_minor);

    let occurred_at = required_str(raw, "occurred_at")?;
    let occurred_at = parse_timestamp(&occurred_at)?;

    Ok(Transaction {
        transaction_id,
        card_id,
        merchant_id,
        merchant_name: raw
            .get("merchant_descriptor")
            .and_then(Value::as_str)
            .map(str::to_owned),
        mcc: raw.get("mcc_code").and_then(Value::as_str).map(str::to_owned),
        amount,
        currency: raw
            .get("currency_code")
            .and_then(Value::as_str)
            .unwrap_or("USD")
            .to_owned(),
        outcome: raw
            .get("disposition")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_lowercase(),
        three_ds_verified: raw
            .get("secure_3ds")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        device_trusted: raw
            .get("device_trust")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        occurred_at,
    })
}

/// Convert minor currency units to major units.
fn to_major_units(minor: i64) -> f64 {
    // i64 -> f64 is lossy above 2^53; transaction amounts are far below.
    #[allow(clippy::cast_precision_loss)]
    {
        minor as f64 / 100.0
    }
}

fn required_str(raw: &Value, field: &str) -> Result<String, TmError> {
    raw.get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| TmError::Translation(format!("missing field {field}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, TmError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TmError::Translation(format!("bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire_transaction() -> Value {
        json!({
            "txn_id": "txn_1",
            "card_token": "tok_abc123def456",
            "merchant_ref": "m_77",
            "merchant_descriptor": "COFFEE SHOP",
            "mcc_code": "5812",
            "amount_minor": 1250,
            "currency_code": "EUR",
            "disposition": "DECLINED",
            "secure_3ds": true,
            "device_trust": false,
            "occurred_at": "2026-03-01T10:30:00Z",
        })
    }

    #[test]
    fn test_translate_full_payload() {
        let txn = translate_transaction(&wire_transaction()).expect("translate");
        assert_eq!(txn.transaction_id, "txn_1");
        assert_eq!(txn.card_id, "tok_abc123def456");
        assert_eq!(txn.merchant_id, "m_77");
        assert_eq!(txn.merchant_name.as_deref(), Some("COFFEE SHOP"));
        assert_eq!(txn.mcc.as_deref(), Some("5812"));
        assert!((txn.amount - 12.50).abs() < f64::EPSILON);
        assert_eq!(txn.currency, "EUR");
        assert_eq!(txn.outcome, "declined");
        assert!(txn.is_declined());
        assert!(txn.three_ds_verified);
        assert!(!txn.device_trusted);
    }

    #[test]
    fn test_translate_defaults_optional_fields() {
        let raw = json!({
            "txn_id": "txn_2",
            "card_token": "tok_x",
            "merchant_ref": "m_1",
            "amount_minor": 100,
            "occurred_at": "2026-03-01T10:30:00Z",
        });
        let txn = translate_transaction(&raw).expect("translate");
        assert_eq!(txn.currency, "USD");
        assert_eq!(txn.outcome, "unknown");
        assert!(txn.merchant_name.is_none());
        assert!(!txn.three_ds_verified);
    }

    #[test]
    fn test_translate_rejects_missing_required() {
        let raw = json!({ "card_token": "tok_x" });
        assert!(matches!(
            translate_transaction(&raw),
            Err(TmError::Translation(_))
        ));
    }

    #[test]
    fn test_translate_rejects_bad_timestamp() {
        let mut raw = wire_transaction();
        raw["occurred_at"] = json!("yesterday");
        assert!(matches!(
            translate_transaction(&raw),
            Err(TmError::Translation(_))
        ));
    }

    #[test]
    fn test_translation_table_covers_internal_names() {
        let internal: Vec<&str> = FIELD_TRANSLATION.iter().map(|(_, to)| *to).collect();
        for name in [
            "transaction_id",
            "card_id",
            "merchant_id",
            "amount",
            "outcome",
        ] {
            assert!(internal.contains(&name), "missing {name}");
        }
    }
}
