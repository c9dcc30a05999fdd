//! Scriptable adapter for tests and local runs
//!
//! Counts calls, records idempotency keys, and plays back a script of
//! outcomes. Honors the idempotency contract: a key that already produced
//! an outcome gets the same outcome again without a second movement.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    IdempotencyKey, InitiateOutcome, ProviderAdapter, ProviderError, ProviderKind, StatusOutcome,
    TransferDetails, VerifyOutcome,
};
use crate::transfer::types::Counterparty;

/// One scripted reaction to `initiate`
#[derive(Debug, Clone)]
pub enum MockStep {
    Complete,
    Pending,
    Reject(String),
    Fail(ProviderError),
    /// Never answers; exercises the caller's timeout
    Hang,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MockProvider {
    kind: ProviderKind,
    verify: Mutex<VerifyOutcome>,
    verify_failures: Mutex<VecDeque<ProviderError>>,
    script: Mutex<VecDeque<MockStep>>,
    default_step: Mutex<MockStep>,
    status: Mutex<VecDeque<Result<StatusOutcome, ProviderError>>>,
    default_status: Mutex<StatusOutcome>,
    outcomes: Mutex<HashMap<String, InitiateOutcome>>,
    keys: Mutex<Vec<String>>,
    verify_count: AtomicUsize,
    initiate_count: AtomicUsize,
    status_count: AtomicUsize,
    lookup_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            verify: Mutex::new(VerifyOutcome::Valid {
                display_name: "MOCK COUNTERPARTY".into(),
            }),
            verify_failures: Mutex::new(VecDeque::new()),
            script: Mutex::new(VecDeque::new()),
            default_step: Mutex::new(MockStep::Complete),
            status: Mutex::new(VecDeque::new()),
            default_status: Mutex::new(StatusOutcome::StillPending),
            outcomes: Mutex::new(HashMap::new()),
            keys: Mutex::new(Vec::new()),
            verify_count: AtomicUsize::new(0),
            initiate_count: AtomicUsize::new(0),
            status_count: AtomicUsize::new(0),
            lookup_count: AtomicUsize::new(0),
        }
    }

    /// Steps consumed in order by successive `initiate` calls
    pub fn push_steps(&self, steps: impl IntoIterator<Item = MockStep>) {
        lock(&self.script).extend(steps);
    }

    /// Used once the script runs out
    pub fn set_default_step(&self, step: MockStep) {
        *lock(&self.default_step) = step;
    }

    pub fn set_verify(&self, outcome: VerifyOutcome) {
        *lock(&self.verify) = outcome;
    }

    /// Errors returned by the next `verify_counterparty` calls
    pub fn push_verify_failures(&self, errors: impl IntoIterator<Item = ProviderError>) {
        lock(&self.verify_failures).extend(errors);
    }

    pub fn push_status(&self, outcomes: impl IntoIterator<Item = Result<StatusOutcome, ProviderError>>) {
        lock(&self.status).extend(outcomes);
    }

    pub fn set_default_status(&self, outcome: StatusOutcome) {
        *lock(&self.default_status) = outcome;
    }

    pub fn verify_count(&self) -> usize {
        self.verify_count.load(Ordering::SeqCst)
    }

    pub fn initiate_count(&self) -> usize {
        self.initiate_count.load(Ordering::SeqCst)
    }

    pub fn status_count(&self) -> usize {
        self.status_count.load(Ordering::SeqCst)
    }

    pub fn lookup_count(&self) -> usize {
        self.lookup_count.load(Ordering::SeqCst)
    }

    /// Idempotency keys in call order, repeats included
    pub fn keys(&self) -> Vec<String> {
        lock(&self.keys).clone()
    }

    /// Distinct keys that moved money at the provider
    pub fn movements(&self) -> usize {
        lock(&self.outcomes)
            .values()
            .filter(|o| !matches!(o, InitiateOutcome::Rejected(_)))
            .count()
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn verify_counterparty(
        &self,
        counterparty: &Counterparty,
    ) -> Result<VerifyOutcome, ProviderError> {
        self.verify_count.fetch_add(1, Ordering::SeqCst);
        counterparty
            .check_identifiers()
            .map_err(ProviderError::InvalidRequest)?;
        if let Some(err) = lock(&self.verify_failures).pop_front() {
            return Err(err);
        }
        Ok(lock(&self.verify).clone())
    }

    async fn initiate(
        &self,
        details: &TransferDetails,
        key: &IdempotencyKey,
    ) -> Result<InitiateOutcome, ProviderError> {
        self.initiate_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.keys).push(key.as_str().to_string());
        details.validate()?;

        if let Some(previous) = lock(&self.outcomes).get(key.as_str()) {
            return Ok(previous.clone());
        }

        let step = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| lock(&self.default_step).clone());
        let reference = format!("mock_{}", key.as_str());
        let outcome = match step {
            MockStep::Complete => InitiateOutcome::Completed(reference),
            MockStep::Pending => InitiateOutcome::Pending(reference),
            MockStep::Reject(reason) => InitiateOutcome::Rejected(reason),
            MockStep::Fail(err) => return Err(err),
            MockStep::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(ProviderError::Timeout);
            }
        };
        lock(&self.outcomes).insert(key.as_str().to_string(), outcome.clone());
        Ok(outcome)
    }

    async fn query_status(&self, _reference: &str) -> Result<StatusOutcome, ProviderError> {
        self.status_count.fetch_add(1, Ordering::SeqCst);
        match lock(&self.status).pop_front() {
            Some(result) => result,
            None => Ok(lock(&self.default_status).clone()),
        }
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<InitiateOutcome>, ProviderError> {
        self.lookup_count.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.outcomes).get(key.as_str()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Currency, TransactionId};

    fn details() -> TransferDetails {
        TransferDetails {
            transaction_id: TransactionId::new(),
            owner_id: 1,
            amount: 100,
            currency: Currency::ngn(),
            counterparty: Counterparty::Card {
                card_id: "c".into(),
            },
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_script_then_default() {
        let mock = MockProvider::new(ProviderKind::Mock);
        mock.push_steps([MockStep::Fail(ProviderError::Timeout), MockStep::Pending]);

        let d = details();
        let key = IdempotencyKey::for_transaction(d.transaction_id);
        assert_eq!(mock.initiate(&d, &key).await, Err(ProviderError::Timeout));
        assert!(matches!(
            mock.initiate(&d, &key).await,
            Ok(InitiateOutcome::Pending(_))
        ));
        // Same key replays the stored outcome
        assert!(matches!(
            mock.initiate(&d, &key).await,
            Ok(InitiateOutcome::Pending(_))
        ));
        assert_eq!(mock.initiate_count(), 3);
        assert_eq!(mock.movements(), 1);
        assert_eq!(mock.keys(), vec![key.as_str().to_string(); 3]);

        assert!(matches!(
            mock.lookup(&key).await,
            Ok(Some(InitiateOutcome::Pending(_)))
        ));
        let unseen = IdempotencyKey::for_transaction(TransactionId::new());
        assert_eq!(mock.lookup(&unseen).await, Ok(None));
    }
}
