//! Budget enforcement
//!
//! A stateless policy matcher over the usage store. Policies are immutable
//! for the process lifetime; every check re-aggregates recorded usage over
//! the current UTC period window.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use thiserror::Error;

use crate::models::{BudgetPeriod, BudgetPolicy, BudgetStatus};
use crate::usage::UsageStore;

#[derive(Error, Debug)]
pub enum BudgetError {
    #[error("token budget exceeded")]
    Exceeded,
    #[error("budget storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, BudgetError>;

/// Checks token usage against budget policies.
pub struct Enforcer {
    policies: Vec<BudgetPolicy>,
    store: UsageStore,
}

impl Enforcer {
    pub fn new(policies: Vec<BudgetPolicy>, store: UsageStore) -> Self {
        Self { policies, store }
    }

    /// Fail with `Exceeded` when any applicable policy's period usage has
    /// reached its limit. A `max_tokens` of zero denies from the start.
    pub async fn check(&self, api_key: &str, model: &str) -> Result<()> {
        for policy in self.applicable_policies(api_key, model) {
            let since = period_start(policy.period);
            let used = self.used_for(policy, api_key, since).await?;
            if used >= policy.max_tokens {
                return Err(BudgetError::Exceeded);
            }
        }
        Ok(())
    }

    /// Current usage against every policy whose key pattern matches,
    /// ignoring the model filter during selection.
    pub async fn status(&self, api_key: &str) -> Result<Vec<BudgetStatus>> {
        let mut statuses = Vec::new();
        for policy in self.policies_for_key(api_key) {
            let since = period_start(policy.period);
            let used = self.used_for(policy, api_key, since).await?;
            statuses.push(BudgetStatus {
                policy: policy.clone(),
                used,
                remaining: (policy.max_tokens - used).max(0),
            });
        }
        Ok(statuses)
    }

    async fn used_for(
        &self,
        policy: &BudgetPolicy,
        api_key: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let used = if policy.model.is_empty() {
            self.store.total_by_key(api_key, since).await
        } else {
            self.store
                .total_by_key_and_model(api_key, &policy.model, since)
                .await
        };
        used.map_err(|e| BudgetError::Storage(e.to_string()))
    }

    fn policies_for_key<'a>(&'a self, api_key: &'a str) -> impl Iterator<Item = &'a BudgetPolicy> {
        self.policies
            .iter()
            .filter(move |p| p.api_key == "*" || p.api_key == api_key)
    }

    fn applicable_policies<'a>(
        &'a self,
        api_key: &'a str,
        model: &'a str,
    ) -> impl Iterator<Item = &'a BudgetPolicy> {
        self.policies_for_key(api_key)
            .filter(move |p| p.model.is_empty() || p.model == model)
    }
}

/// Start of the current UTC period: midnight today for daily policies, the
/// first of the month for monthly ones.
fn period_start(period: BudgetPeriod) -> DateTime<Utc> {
    let now = Utc::now();
    match period {
        BudgetPeriod::Monthly => Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .expect("first of month is always valid"),
        BudgetPeriod::Daily => Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .expect("midnight is always valid"),
    }
}
