//! Limit Aggregator
//!
//! Sums the owner's completed-or-processing transactions of one class since
//! local midnight, adds amounts reserved by requests still in evaluation in
//! this process, and compares against the cap.
//!
//! The aggregate is advisory: two processes racing on the same owner can
//! overshoot a cap by at most one request. The wallet balance invariant is
//! enforced separately and strictly by the wallet store.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{LimitStore, VerificationTier, day_start};
use crate::core_types::{MinorUnits, OwnerId, TransactionClass};
use crate::error::EngineError;
use crate::transfer::store::TransactionStore;

type ReservationKey = (OwnerId, TransactionClass);

pub struct LimitAggregator {
    limits: Arc<dyn LimitStore>,
    transactions: Arc<dyn TransactionStore>,
    reserved: Arc<DashMap<ReservationKey, MinorUnits>>,
    day_offset: FixedOffset,
}

/// Amount held against a cap until the transaction row reflects the debit
///
/// Dropping the reservation releases it.
#[derive(Debug)]
pub struct LimitReservation {
    key: ReservationKey,
    amount: MinorUnits,
    tier: VerificationTier,
    reserved: Arc<DashMap<ReservationKey, MinorUnits>>,
}

impl LimitReservation {
    pub fn amount(&self) -> MinorUnits {
        self.amount
    }

    /// Tier of the limit row the check ran against
    pub fn tier(&self) -> VerificationTier {
        self.tier
    }
}

impl Drop for LimitReservation {
    fn drop(&mut self) {
        let emptied = match self.reserved.get_mut(&self.key) {
            Some(mut held) => {
                *held = held.saturating_sub(self.amount);
                *held == 0
            }
            None => false,
        };
        if emptied {
            self.reserved.remove_if(&self.key, |_, held| *held == 0);
        }
    }
}

impl LimitAggregator {
    pub fn new(
        limits: Arc<dyn LimitStore>,
        transactions: Arc<dyn TransactionStore>,
        day_offset: FixedOffset,
    ) -> Self {
        Self {
            limits,
            transactions,
            reserved: Arc::new(DashMap::new()),
            day_offset,
        }
    }

    pub async fn check_and_reserve(
        &self,
        owner_id: OwnerId,
        class: TransactionClass,
        amount: MinorUnits,
    ) -> Result<LimitReservation, EngineError> {
        self.check_and_reserve_at(owner_id, class, amount, Utc::now())
            .await
    }

    pub async fn check_and_reserve_at(
        &self,
        owner_id: OwnerId,
        class: TransactionClass,
        amount: MinorUnits,
        now: DateTime<Utc>,
    ) -> Result<LimitReservation, EngineError> {
        let (cap, tier) = self.cap(owner_id, class).await?;
        let spent = self.spent(owner_id, class, now).await?;

        let key = (owner_id, class);
        // Read and bump under the entry lock so concurrent requests in this
        // process see each other's reservations.
        let mut held = self.reserved.entry(key).or_insert(0);
        let used = spent.saturating_add(*held);
        if used.saturating_add(amount) > cap {
            let available = cap.saturating_sub(used);
            drop(held);
            self.reserved.remove_if(&key, |_, held| *held == 0);
            debug!(
                owner_id,
                class = %class,
                cap,
                spent,
                amount,
                available,
                "Daily limit exceeded"
            );
            return Err(EngineError::LimitExceeded { available });
        }
        *held += amount;
        drop(held);

        Ok(LimitReservation {
            key,
            amount,
            tier,
            reserved: self.reserved.clone(),
        })
    }

    /// Re-run the check immediately before the debit, counting the
    /// reservation's own amount once.
    pub async fn recheck(&self, reservation: &LimitReservation) -> Result<(), EngineError> {
        self.recheck_at(reservation, Utc::now()).await
    }

    pub async fn recheck_at(
        &self,
        reservation: &LimitReservation,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let (owner_id, class) = reservation.key;
        let (cap, _) = self.cap(owner_id, class).await?;
        let spent = self.spent(owner_id, class, now).await?;
        let others = self
            .reserved
            .get(&reservation.key)
            .map(|held| held.saturating_sub(reservation.amount))
            .unwrap_or(0);

        let used = spent.saturating_add(others);
        if used.saturating_add(reservation.amount) > cap {
            warn!(
                owner_id,
                class = %class,
                cap,
                spent,
                "Limit recheck failed before debit"
            );
            return Err(EngineError::LimitExceeded {
                available: cap.saturating_sub(used),
            });
        }
        Ok(())
    }

    /// Currently reserved (not yet debited) amount for an owner/class pair
    pub fn reserved(&self, owner_id: OwnerId, class: TransactionClass) -> MinorUnits {
        self.reserved
            .get(&(owner_id, class))
            .map(|held| *held)
            .unwrap_or(0)
    }

    /// Missing limit row or class cap fails closed with zero allowance.
    async fn cap(
        &self,
        owner_id: OwnerId,
        class: TransactionClass,
    ) -> Result<(MinorUnits, VerificationTier), EngineError> {
        let limit = self
            .limits
            .get(owner_id)
            .await?
            .ok_or(EngineError::LimitExceeded { available: 0 })?;
        let cap = limit
            .cap_for(class)
            .ok_or(EngineError::LimitExceeded { available: 0 })?;
        Ok((cap, limit.tier))
    }

    async fn spent(
        &self,
        owner_id: OwnerId,
        class: TransactionClass,
        now: DateTime<Utc>,
    ) -> Result<MinorUnits, EngineError> {
        self.transactions
            .sum_for_window(owner_id, class, day_start(now, self.day_offset))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Currency, TransactionId};
    use crate::limits::{InMemoryLimitStore, TransactionLimit};
    use crate::transfer::state::TransactionStatus;
    use crate::transfer::store::InMemoryTransactionStore;
    use crate::transfer::types::{Counterparty, Transaction};
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    fn wat() -> FixedOffset {
        FixedOffset::east_opt(3600).unwrap()
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 11, 0, 0).unwrap()
    }

    async fn setup(cap: Option<MinorUnits>) -> (LimitAggregator, Arc<InMemoryTransactionStore>) {
        let limits = Arc::new(InMemoryLimitStore::new());
        if let Some(cap) = cap {
            limits
                .put(TransactionLimit {
                    owner_id: 7,
                    tier: VerificationTier::Standard,
                    caps: HashMap::from([(TransactionClass::Bill, cap)]),
                })
                .await
                .unwrap();
        }
        let txs = Arc::new(InMemoryTransactionStore::new());
        (LimitAggregator::new(limits, txs.clone(), wat()), txs)
    }

    async fn spend(
        txs: &InMemoryTransactionStore,
        amount: MinorUnits,
        status: TransactionStatus,
        at: DateTime<Utc>,
    ) {
        let mut tx = Transaction::new(
            TransactionId::new(),
            7,
            1,
            TransactionClass::Bill,
            amount,
            Currency::ngn(),
            Counterparty::Biller {
                service_id: "ikeja-electric".into(),
                customer_id: "1111".into(),
                variation_code: None,
                phone: None,
            },
            String::new(),
            None,
        );
        tx.status = status;
        tx.created_at = at;
        txs.create(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_breach_reports_available() {
        let (agg, txs) = setup(Some(20_000)).await;
        spend(&txs, 15_000, TransactionStatus::Completed, noon() - Duration::hours(1)).await;

        let err = agg
            .check_and_reserve_at(7, TransactionClass::Bill, 10_000, noon())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::LimitExceeded { available: 5000 });
        assert_eq!(agg.reserved(7, TransactionClass::Bill), 0);

        let ok = agg
            .check_and_reserve_at(7, TransactionClass::Bill, 5_000, noon())
            .await
            .unwrap();
        assert_eq!(ok.tier(), VerificationTier::Standard);
    }

    #[tokio::test]
    async fn test_only_processing_states_count() {
        let (agg, txs) = setup(Some(20_000)).await;
        spend(&txs, 15_000, TransactionStatus::Failed, noon()).await;
        spend(&txs, 15_000, TransactionStatus::RiskChecked, noon()).await;
        spend(&txs, 5_000, TransactionStatus::Pending, noon()).await;

        assert!(
            agg.check_and_reserve_at(7, TransactionClass::Bill, 15_000, noon())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_window_starts_at_local_midnight() {
        let (agg, txs) = setup(Some(20_000)).await;
        // 22:30 UTC yesterday = 23:30 Lagos, previous day
        spend(
            &txs,
            20_000,
            TransactionStatus::Completed,
            Utc.with_ymd_and_hms(2026, 3, 9, 22, 30, 0).unwrap(),
        )
        .await;
        assert!(
            agg.check_and_reserve_at(7, TransactionClass::Bill, 20_000, noon())
                .await
                .is_ok()
        );

        // 23:30 UTC yesterday = 00:30 Lagos today
        spend(
            &txs,
            1,
            TransactionStatus::Completed,
            Utc.with_ymd_and_hms(2026, 3, 9, 23, 30, 0).unwrap(),
        )
        .await;
        assert!(
            agg.check_and_reserve_at(7, TransactionClass::Bill, 20_000, noon())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_missing_limit_fails_closed() {
        let (agg, _) = setup(None).await;
        let err = agg
            .check_and_reserve_at(7, TransactionClass::Bill, 1, noon())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::LimitExceeded { available: 0 });

        let (agg, _) = setup(Some(20_000)).await;
        let err = agg
            .check_and_reserve_at(7, TransactionClass::GiftCard, 1, noon())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::LimitExceeded { available: 0 });
    }

    #[tokio::test]
    async fn test_reservations_block_concurrent_requests_until_dropped() {
        let (agg, _) = setup(Some(20_000)).await;
        let first = agg
            .check_and_reserve_at(7, TransactionClass::Bill, 12_000, noon())
            .await
            .unwrap();
        assert_eq!(agg.reserved(7, TransactionClass::Bill), 12_000);

        let err = agg
            .check_and_reserve_at(7, TransactionClass::Bill, 10_000, noon())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::LimitExceeded { available: 8_000 });

        agg.recheck_at(&first, noon()).await.unwrap();
        drop(first);
        assert_eq!(agg.reserved(7, TransactionClass::Bill), 0);
        assert!(
            agg.check_and_reserve_at(7, TransactionClass::Bill, 10_000, noon())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_recheck_sees_spend_committed_meanwhile() {
        let (agg, txs) = setup(Some(20_000)).await;
        let held = agg
            .check_and_reserve_at(7, TransactionClass::Bill, 10_000, noon())
            .await
            .unwrap();
        spend(&txs, 15_000, TransactionStatus::Debited, noon()).await;

        let err = agg.recheck_at(&held, noon()).await.unwrap_err();
        assert_eq!(err, EngineError::LimitExceeded { available: 5_000 });
    }
}
