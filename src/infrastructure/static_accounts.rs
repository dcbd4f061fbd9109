//! Account provider backed by an in-process table. Suits single-operator deployments and tests;
//! multi-tenant platforms implement `AccountProvider` against their own user store.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::domain::entities::credential::ExchangeCredential;
use crate::domain::entities::risk_policy::RiskPolicy;
use crate::domain::repositories::account_provider::{AccountError, AccountProvider};

fn subscribed_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountProfile {
    pub credentials: Vec<ExchangeCredential>,
    #[serde(default)]
    pub policy: RiskPolicy,
    pub free_balance: f64,
    #[serde(default)]
    pub active_plan: bool,
    #[serde(default = "subscribed_by_default")]
    pub subscribed: bool,
}

impl AccountProfile {
    pub fn new(credentials: Vec<ExchangeCredential>, policy: RiskPolicy, free_balance: f64) -> Self {
        Self {
            credentials,
            policy,
            free_balance,
            active_plan: false,
            subscribed: true,
        }
    }

    pub fn with_plan(mut self, active: bool) -> Self {
        self.active_plan = active;
        self
    }
}

#[derive(Debug, Default)]
pub struct StaticAccounts {
    profiles: RwLock<BTreeMap<String, AccountProfile>>,
}

impl StaticAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{"user_id": AccountProfile, ...}`
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let profiles: BTreeMap<String, AccountProfile> = serde_json::from_str(raw)?;
        Ok(Self {
            profiles: RwLock::new(profiles),
        })
    }

    pub fn with_user(self, user_id: &str, profile: AccountProfile) -> Self {
        self.upsert(user_id, profile);
        self
    }

    pub fn upsert(&self, user_id: &str, profile: AccountProfile) {
        let mut profiles = match self.profiles.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        profiles.insert(user_id.to_string(), profile);
    }

    /// Apply `f` to the user's profile; false if the user is unknown
    pub fn modify(&self, user_id: &str, f: impl FnOnce(&mut AccountProfile)) -> bool {
        let mut profiles = match self.profiles.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match profiles.get_mut(user_id) {
            Some(profile) => {
                f(profile);
                true
            }
            None => false,
        }
    }

    fn profile(&self, user_id: &str) -> Result<AccountProfile, AccountError> {
        let profiles = match self.profiles.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| AccountError::UnknownUser(user_id.to_string()))
    }
}

#[async_trait]
impl AccountProvider for StaticAccounts {
    async fn credentials(&self, user_id: &str) -> Result<Vec<ExchangeCredential>, AccountError> {
        Ok(self.profile(user_id)?.credentials)
    }

    async fn risk_policy(&self, user_id: &str) -> Result<RiskPolicy, AccountError> {
        Ok(self.profile(user_id)?.policy)
    }

    async fn free_balance(&self, user_id: &str, _quote_asset: &str) -> Result<f64, AccountError> {
        Ok(self.profile(user_id)?.free_balance)
    }

    async fn has_active_plan(&self, user_id: &str) -> Result<bool, AccountError> {
        Ok(self.profile(user_id)?.active_plan)
    }

    async fn subscribed_users(&self) -> Result<Vec<String>, AccountError> {
        let profiles = match self.profiles.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(profiles
            .iter()
            .filter(|(_, p)| p.subscribed)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::exchange::Exchange;

    #[tokio::test]
    async fn test_lookup_and_subscription() {
        let accounts = StaticAccounts::new()
            .with_user(
                "u2",
                AccountProfile::new(vec![], RiskPolicy::default(), 100.0),
            )
            .with_user(
                "u1",
                AccountProfile::new(
                    vec![ExchangeCredential::new("c1", "u1", Exchange::Binance)],
                    RiskPolicy::default(),
                    1000.0,
                )
                .with_plan(true),
            );

        assert_eq!(accounts.credentials("u1").await.unwrap().len(), 1);
        assert!(accounts.has_active_plan("u1").await.unwrap());
        assert_eq!(accounts.subscribed_users().await.unwrap(), vec!["u1", "u2"]);
        assert_eq!(
            accounts.free_balance("ghost", "USDT").await,
            Err(AccountError::UnknownUser("ghost".to_string()))
        );

        assert!(accounts.modify("u2", |p| p.subscribed = false));
        assert_eq!(accounts.subscribed_users().await.unwrap(), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_from_json_applies_defaults() {
        let raw = r#"{
            "alice": {
                "credentials": [{
                    "id": "alice-binance",
                    "user_id": "alice",
                    "exchange": "binance",
                    "active": true,
                    "validated": true
                }],
                "free_balance": 2500.0
            }
        }"#;
        let accounts = StaticAccounts::from_json(raw).unwrap();
        assert_eq!(accounts.subscribed_users().await.unwrap(), vec!["alice"]);
        assert!(!accounts.has_active_plan("alice").await.unwrap());
        assert_eq!(accounts.risk_policy("alice").await.unwrap(), RiskPolicy::default());
        assert!(StaticAccounts::from_json("[]").is_err());
    }
}
