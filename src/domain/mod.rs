pub mod decision;
pub mod record;
pub mod rule;
pub mod transaction;

pub use decision::Decision;
pub use record::DecisionRecord;
pub use rule::{Rule, RuleConfig, RuleDocument, RuleEntry, RuleStats, RuleThresholds};
pub use transaction::{
    CardInfo, CustomerInfo, DeviceInfo, RequestId, Transaction, TransactionInfo, ValidationError,
};
