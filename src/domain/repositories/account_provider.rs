use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::credential::ExchangeCredential;
use crate::domain::entities::risk_policy::RiskPolicy;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AccountError {
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Account service unavailable: {0}")]
    Unavailable(String),
}

/// User accounts, credentials, policies and billing status.
///
/// Owned by the surrounding platform; the engine only reads from it.
#[async_trait]
pub trait AccountProvider: Send + Sync {
    /// Every credential registered by the user, usable or not
    async fn credentials(&self, user_id: &str) -> Result<Vec<ExchangeCredential>, AccountError>;

    async fn risk_policy(&self, user_id: &str) -> Result<RiskPolicy, AccountError>;

    /// Free balance in `quote_asset`
    async fn free_balance(&self, user_id: &str, quote_asset: &str) -> Result<f64, AccountError>;

    async fn has_active_plan(&self, user_id: &str) -> Result<bool, AccountError>;

    /// Users who receive broadcast signals
    async fn subscribed_users(&self) -> Result<Vec<String>, AccountError>;
}
