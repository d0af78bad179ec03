use evalexpr::{ContextWithMutableVariables, EvalexprResult, HashMapContext, Value};
use serde::{Deserialize, Serialize};

use crate::domain::Transaction;

/// Features computed outside the core and fed into rule expressions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedFeatures {
    pub merchant_risk: f64,
    /// Transactions by this customer in the last hour, including this one
    pub hourly_count: u32,
    pub amount_sum: f64,
    pub ip_blacklist_match: bool,
}

impl DerivedFeatures {
    /// Neutral values used when no feature computation is available.
    pub fn neutral(amount: f64) -> Self {
        DerivedFeatures {
            merchant_risk: 0.0,
            hourly_count: 1,
            amount_sum: amount,
            ip_blacklist_match: false,
        }
    }
}

/// Names of the numeric variables, in [`RuleContext::numeric_values`] order.
pub const NUMERIC_VARIABLES: [&str; 8] = [
    "amount",
    "merchant_category",
    "customer_risk_score",
    "account_age_days",
    "merchant_risk",
    "hourly_count",
    "amount_sum",
    "ip_blacklist_match",
];

/// Flat variable record rule expressions are evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleContext {
    pub amount: f64,
    pub currency: String,
    pub merchant_id: String,
    pub merchant_category: u16,
    pub pos_entry_mode: String,

    pub card_token: String,
    pub issuer_country: String,
    pub card_brand: String,

    pub ip_address: String,
    pub device_fingerprint: String,
    pub user_agent: String,

    pub customer_id: String,
    pub customer_risk_score: f64,
    pub account_age_days: u32,

    pub features: DerivedFeatures,
}

impl RuleContext {
    /// Build a context with neutral derived features.
    pub fn from_transaction(tx: &Transaction) -> Self {
        Self::with_features(tx, DerivedFeatures::neutral(tx.transaction.amount))
    }

    /// Build a context with externally computed features.
    pub fn with_features(tx: &Transaction, features: DerivedFeatures) -> Self {
        RuleContext {
            amount: tx.transaction.amount,
            currency: tx.transaction.currency.clone(),
            merchant_id: tx.transaction.merchant_id.clone(),
            merchant_category: tx.transaction.merchant_category,
            pos_entry_mode: tx.transaction.pos_entry_mode.clone(),

            card_token: tx.card.token.clone(),
            issuer_country: tx.card.issuer_country.clone(),
            card_brand: tx.card.card_brand.clone(),

            ip_address: tx.device.ip.clone(),
            device_fingerprint: tx.device.fingerprint.clone(),
            user_agent: tx.device.user_agent.clone(),

            customer_id: tx.customer.id.clone(),
            customer_risk_score: tx.customer.risk_score,
            account_age_days: tx.customer.account_age_days,

            features,
        }
    }

    /// Minimum data required for evaluation.
    pub fn is_valid(&self) -> bool {
        !self.customer_id.is_empty()
            && !self.merchant_id.is_empty()
            && !self.currency.is_empty()
            && self.amount > 0.0
    }

    /// Numeric variables in binding order, used for feature vectors.
    pub fn numeric_values(&self) -> [f64; 8] {
        [
            self.amount,
            self.merchant_category as f64,
            self.customer_risk_score,
            self.account_age_days as f64,
            self.features.merchant_risk,
            self.features.hourly_count as f64,
            self.features.amount_sum,
            if self.features.ip_blacklist_match { 1.0 } else { 0.0 },
        ]
    }

    /// Write every variable into a binding table.
    ///
    /// Numbers are always bound as floats, so arithmetic never truncates
    /// and equality compares values. Text is bound as strings. The types
    /// never change between calls, so the table is refreshed in place.
    pub fn bind(&self, ctx: &mut HashMapContext) -> EvalexprResult<()> {
        for (name, value) in NUMERIC_VARIABLES.iter().zip(self.numeric_values()) {
            ctx.set_value(name.to_string(), Value::Float(value))?;
        }

        let strings = [
            ("currency", &self.currency),
            ("merchant_id", &self.merchant_id),
            ("pos_entry_mode", &self.pos_entry_mode),
            ("card_token", &self.card_token),
            ("issuer_country", &self.issuer_country),
            ("card_brand", &self.card_brand),
            ("ip_address", &self.ip_address),
            ("device_fingerprint", &self.device_fingerprint),
            ("user_agent", &self.user_agent),
            ("customer_id", &self.customer_id),
        ];
        for (name, value) in strings {
            ctx.set_value(name.to_string(), Value::String(value.clone()))?;
        }

        Ok(())
    }
}
