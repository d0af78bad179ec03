use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// Smallest accepted transaction amount.
pub const MIN_AMOUNT: f64 = 0.01;

/// Largest accepted transaction amount.
pub const MAX_AMOUNT: f64 = 1_000_000.0;

/// Transactions may carry timestamps at most this far in the future.
const MAX_FUTURE_SKEW_HOURS: i64 = 1;

/// Width of the time bucket used in feature cache keys.
const CACHE_BUCKET_MINUTES: i64 = 5;

/// Unique request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        RequestId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        RequestId::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payment details of the transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub amount: f64,
    pub currency: String,
    pub merchant_id: String,
    pub merchant_category: u16,
    pub pos_entry_mode: String,
}

/// Card used for the payment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardInfo {
    /// Tokenized card number
    pub token: String,
    pub issuer_country: String,
    pub card_brand: String,
}

/// Device the payment originated from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ip: String,
    pub fingerprint: String,
    pub user_agent: String,
}

/// Customer making the payment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub id: String,
    /// Base risk score in [0, 100]
    pub risk_score: f64,
    pub account_age_days: u32,
}

/// Typed transaction record consumed by the scoring core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub request_id: RequestId,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    pub transaction: TransactionInfo,
    pub card: CardInfo,
    pub device: DeviceInfo,
    pub customer: CustomerInfo,
}

/// Validation failure naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid field '{field}': {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError {
            field,
            reason: reason.into(),
        }
    }
}

fn check_len(
    field: &'static str,
    value: &str,
    max: usize,
    allow_empty: bool,
) -> Result<(), ValidationError> {
    if !allow_empty && value.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if value.len() > max {
        return Err(ValidationError::new(
            field,
            format!("length {} exceeds maximum {}", value.len(), max),
        ));
    }
    Ok(())
}

impl Transaction {
    /// Create a transaction with a fresh request id and the current time.
    pub fn new(
        transaction: TransactionInfo,
        card: CardInfo,
        device: DeviceInfo,
        customer: CustomerInfo,
    ) -> Self {
        Transaction {
            request_id: RequestId::new(),
            timestamp: Utc::now(),
            transaction,
            card,
            device,
            customer,
        }
    }

    /// Check the record against the accepted field limits.
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_len("request_id", self.request_id.as_str(), 100, false)?;

        let max_future = Utc::now() + Duration::hours(MAX_FUTURE_SKEW_HOURS);
        if self.timestamp > max_future {
            return Err(ValidationError::new("timestamp", "too far in the future"));
        }

        let tx = &self.transaction;
        if !(MIN_AMOUNT..=MAX_AMOUNT).contains(&tx.amount) {
            return Err(ValidationError::new(
                "transaction.amount",
                format!("{} outside [{}, {}]", tx.amount, MIN_AMOUNT, MAX_AMOUNT),
            ));
        }
        check_len("transaction.currency", &tx.currency, 3, false)?;
        check_len("transaction.merchant_id", &tx.merchant_id, 50, false)?;
        if tx.merchant_category == 0 {
            return Err(ValidationError::new(
                "transaction.merchant_category",
                "must be positive",
            ));
        }
        check_len("transaction.pos_entry_mode", &tx.pos_entry_mode, 20, false)?;

        check_len("card.token", &self.card.token, 100, false)?;
        check_len("card.issuer_country", &self.card.issuer_country, 2, false)?;
        check_len("card.card_brand", &self.card.card_brand, 20, false)?;

        if self.device.ip.parse::<IpAddr>().is_err() {
            return Err(ValidationError::new(
                "device.ip",
                format!("'{}' is not an IP address", self.device.ip),
            ));
        }
        check_len("device.fingerprint", &self.device.fingerprint, 100, false)?;
        check_len("device.user_agent", &self.device.user_agent, 500, false)?;

        check_len("customer.id", &self.customer.id, 50, false)?;
        if !(0.0..=100.0).contains(&self.customer.risk_score) {
            return Err(ValidationError::new(
                "customer.risk_score",
                "must be within [0, 100]",
            ));
        }
        if self.customer.account_age_days > 36_500 {
            return Err(ValidationError::new(
                "customer.account_age_days",
                "exceeds 36500 days",
            ));
        }

        Ok(())
    }

    /// Feature cache key: customer, merchant and a 5-minute time bucket.
    pub fn cache_key(&self) -> String {
        let bucket = self.timestamp.timestamp() / 60 / CACHE_BUCKET_MINUTES;
        format!(
            "features:{}:{}:{}",
            self.customer.id, self.transaction.merchant_id, bucket
        )
    }
}
