//! Simulated payment settlement.
//!
//! Approving a payment is immediate, but the participant is only marked as
//! paid once a delay has elapsed. Each pending settlement is persisted and
//! driven by a [`ScheduledTask`], so settlements survive restarts.

use chrono::{Duration, Utc};
use mongodb::Database;
use rocket::{
    fairing::{Fairing, Info, Kind},
    futures::future::{BoxFuture, FutureExt},
    tokio::sync::Mutex,
    Build, Orbit, Rocket,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{
    error::{Error, Result},
    model::{
        common::identity::IdentityHash,
        db::{participant::Participant, settlement::PendingSettlement},
        mongodb::Coll,
    },
    scheduled_task::ScheduledTask,
};

/// Seconds to wait before retrying a settlement that failed to reach the store.
const RETRY_INTERVAL_SECONDS: i64 = 30;

/// A settlement task, tagged with a number unique to it so that a finishing
/// settler only ever clears its own entry.
struct Scheduled {
    seq: u64,
    task: ScheduledTask<Result<()>>,
}

impl Scheduled {
    fn next_seq() -> u64 {
        static SETTLEMENT_SEQ: AtomicU64 = AtomicU64::new(0);
        SETTLEMENT_SEQ.fetch_add(1, Ordering::Relaxed)
    }
}

/// Map from identity hashes to settlement tasks.
type TaskMap = HashMap<IdentityHash, Scheduled>;

/// Payment settlements: scheduled tasks marking participants as paid.
pub struct PaymentSettlements {
    tasks: Arc<Mutex<TaskMap>>,
    participants: Coll<Participant>,
    pending: Coll<PendingSettlement>,
}

impl PaymentSettlements {
    /// Create an empty set of settlements operating on the given database.
    pub fn new(db: &Database) -> Self {
        Self {
            tasks: Default::default(),
            participants: Coll::from_db(db),
            pending: Coll::from_db(db),
        }
    }

    /// Approve a simulated payment: the participant will be marked as paid
    /// once `delay` has elapsed. Repeated approvals for the same identity
    /// while one is pending do not postpone it.
    pub async fn approve(
        &self,
        identity_hash: &IdentityHash,
        delay: Duration,
    ) -> Result<PendingSettlement> {
        let settlement = PendingSettlement::record(&self.pending, identity_hash, delay).await?;
        self.schedule(&settlement).await;
        Ok(settlement)
    }

    /// Schedule every settlement left pending by a previous run.
    /// Those already overdue are applied immediately.
    pub async fn schedule_pending(&self) -> Result<usize> {
        let pending = PendingSettlement::all(&self.pending).await?;
        let count = pending.len();
        for settlement in pending {
            self.schedule(&settlement).await;
        }
        Ok(count)
    }

    /// Is a settlement scheduled for this identity?
    pub async fn is_scheduled(&self, identity_hash: &IdentityHash) -> bool {
        self.tasks.lock().await.contains_key(identity_hash)
    }

    /// Schedule the given settlement, unless one is already scheduled for the identity.
    async fn schedule(&self, settlement: &PendingSettlement) {
        let mut tasks_locked = self.tasks.lock().await;
        if tasks_locked.contains_key(&settlement.identity_hash) {
            trace!(
                "Settlement for {} already scheduled",
                settlement.identity_hash.short()
            );
            return;
        }
        let seq = Scheduled::next_seq();
        let settler = Self::settler(
            settlement.identity_hash.clone(),
            seq,
            self.participants.clone(),
            self.pending.clone(),
            self.tasks.clone(),
        );
        let task = ScheduledTask::new(settler, settlement.settle_at);
        tasks_locked.insert(settlement.identity_hash.clone(), Scheduled { seq, task });
    }

    /// Immediately apply the scheduled settlement for this identity.
    /// If none is scheduled (or it already completed), this has no effect.
    pub async fn settle_now(&self, identity_hash: &IdentityHash) -> Result<()> {
        let mut tasks_locked = self.tasks.lock().await;
        let task = tasks_locked.remove(identity_hash);
        drop(tasks_locked); // Avoid deadlock, as the settler needs the lock too.
        match task {
            Some(Scheduled { task: settler, .. }) => {
                settler.trigger_now();
                settler.await.unwrap_or_else(|_| {
                    Err(Error::Internal(format!(
                        "Failed to settle payment for {}",
                        identity_hash.short()
                    )))
                })
            }
            None => Ok(()),
        }
    }

    /// Cancel every scheduled settlement. Their pending records are kept,
    /// so they will be rescheduled on the next start.
    /// Returns how many were still outstanding.
    pub async fn shutdown(&self) -> usize {
        let tasks: Vec<_> = self.tasks.lock().await.drain().collect();
        let mut outstanding = 0;
        for (_, scheduled) in tasks {
            if !scheduled.task.cancel().await {
                outstanding += 1;
            }
        }
        outstanding
    }

    /// Settle the payment for the given identity.
    /// Since this is a recursive async function, we must use `BoxFuture` to
    /// avoid an infinitely-recursive state machine.
    fn settler(
        identity_hash: IdentityHash,
        seq: u64,
        participants: Coll<Participant>,
        pending: Coll<PendingSettlement>,
        tasks: Arc<Mutex<TaskMap>>,
    ) -> BoxFuture<'static, Result<()>> {
        /// Nested function for error handling.
        async fn settle(
            identity_hash: &IdentityHash,
            participants: &Coll<Participant>,
            pending: &Coll<PendingSettlement>,
        ) -> Result<()> {
            Participant::mark_paid(participants, identity_hash).await?;
            PendingSettlement::remove(pending, identity_hash).await
        }

        async move {
            let result = settle(&identity_hash, &participants, &pending).await;
            let mut tasks_locked = tasks.lock().await;
            // Another settlement for this identity may have been scheduled
            // since this one was taken out of the map; leave it alone.
            let superseded = tasks_locked
                .get(&identity_hash)
                .map_or(false, |scheduled| scheduled.seq != seq);
            match result {
                Ok(()) => {
                    if !superseded {
                        tasks_locked.remove(&identity_hash);
                    }
                    info!("Settled payment for {}", identity_hash.short());
                }
                Err(ref e) => {
                    error!(
                        "Settlement for {} failed: {e}",
                        identity_hash.short()
                    );
                    if superseded {
                        debug!(
                            "Newer settlement for {} already scheduled, not retrying",
                            identity_hash.short()
                        );
                    } else {
                        // Re-schedule the settlement.
                        let retry_seq = Scheduled::next_seq();
                        let retry = Self::settler(
                            identity_hash.clone(),
                            retry_seq,
                            participants,
                            pending,
                            tasks.clone(),
                        );
                        let retry_time = Utc::now() + Duration::seconds(RETRY_INTERVAL_SECONDS);
                        let task = ScheduledTask::new(retry, retry_time);
                        tasks_locked.insert(identity_hash, Scheduled { seq: retry_seq, task });
                        warn!(
                            "Failed settlement will be retried in {RETRY_INTERVAL_SECONDS} seconds"
                        );
                    }
                }
            }
            drop(tasks_locked);
            result
        }
        .boxed()
    }
}

/// A fairing that reschedules every pending settlement during Rocket
/// ignition and places a `PaymentSettlements` into managed state, then
/// cancels the in-memory tasks on shutdown.
/// This fairing depends on the database being available in managed state,
/// and so must be attached after the fairing responsible for that.
pub struct PaymentSettlementFairing;

#[rocket::async_trait]
impl Fairing for PaymentSettlementFairing {
    fn info(&self) -> Info {
        Info {
            name: "Payment Settlements",
            kind: Kind::Ignite | Kind::Shutdown,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        info!("Scheduling pending payment settlements...");
        let settlements = match rocket.state::<Database>() {
            Some(db) => PaymentSettlements::new(db),
            None => {
                error!("Database was not available when scheduling settlements");
                return Err(rocket);
            }
        };
        match settlements.schedule_pending().await {
            Ok(count) => info!("...{count} pending settlements scheduled!"),
            Err(e) => {
                error!("Failed to schedule pending settlements: {e}");
                return Err(rocket);
            }
        }

        rocket = rocket.manage(settlements);
        Ok(rocket)
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        if let Some(settlements) = rocket.state::<PaymentSettlements>() {
            let outstanding = settlements.shutdown().await;
            if outstanding > 0 {
                warn!("{outstanding} payment settlements left pending until next start");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mongodb::Database;
    use rocket::tokio::time::{sleep, Duration as StdDuration};

    use super::*;
    use crate::model::{
        api::participant::ParticipantStatus, common::identity::Identity,
        db::participant::NewParticipant,
    };

    async fn registered(db: &Database) -> IdentityHash {
        let hash = Identity::example().hash();
        Participant::register_if_absent(&Coll::<NewParticipant>::from_db(db), &hash)
            .await
            .unwrap();
        hash
    }

    #[backend_test]
    async fn settles_after_delay(db: Database, participants: Coll<Participant>) {
        let settlements = PaymentSettlements::new(&db);
        let hash = registered(&db).await;

        settlements
            .approve(&hash, Duration::milliseconds(200))
            .await
            .unwrap();
        assert!(settlements.is_scheduled(&hash).await);
        assert_eq!(
            Participant::status(&participants, &hash).await.unwrap(),
            ParticipantStatus::default()
        );

        sleep(StdDuration::from_millis(1000)).await;
        assert!(Participant::status(&participants, &hash).await.unwrap().paid);
        assert!(!settlements.is_scheduled(&hash).await);
        let pending = Coll::<PendingSettlement>::from_db(&db);
        assert!(PendingSettlement::all(&pending).await.unwrap().is_empty());
    }

    #[backend_test]
    async fn settle_now_skips_delay(db: Database, participants: Coll<Participant>) {
        let settlements = PaymentSettlements::new(&db);
        let hash = registered(&db).await;

        settlements.approve(&hash, Duration::hours(1)).await.unwrap();
        settlements.settle_now(&hash).await.unwrap();

        assert!(Participant::status(&participants, &hash).await.unwrap().paid);
        // Nothing left to settle.
        settlements.settle_now(&hash).await.unwrap();
    }

    #[backend_test]
    async fn unregistered_settlement_is_harmless(db: Database, participants: Coll<Participant>) {
        let settlements = PaymentSettlements::new(&db);
        let hash = Identity::example2().hash();

        settlements.approve(&hash, Duration::hours(1)).await.unwrap();
        settlements.settle_now(&hash).await.unwrap();

        assert_eq!(participants.count_documents(None, None).await.unwrap(), 0);
    }

    #[backend_test]
    async fn pending_settlements_survive_restart(db: Database, participants: Coll<Participant>) {
        let hash = registered(&db).await;

        // First run: approve, then shut down before the settlement is due.
        let before = PaymentSettlements::new(&db);
        before.approve(&hash, Duration::hours(1)).await.unwrap();
        assert_eq!(before.shutdown().await, 1);
        assert!(!before.is_scheduled(&hash).await);
        assert!(!Participant::status(&participants, &hash).await.unwrap().paid);

        // Second run: the pending settlement is picked up again.
        let after = PaymentSettlements::new(&db);
        assert_eq!(after.schedule_pending().await.unwrap(), 1);
        assert!(after.is_scheduled(&hash).await);
        after.settle_now(&hash).await.unwrap();
        assert!(Participant::status(&participants, &hash).await.unwrap().paid);
    }

    #[backend_test]
    async fn finishing_settlement_keeps_newer_one(db: Database, participants: Coll<Participant>) {
        let settlements = PaymentSettlements::new(&db);
        let hash = registered(&db).await;
        let settlement = settlements
            .approve(&hash, Duration::hours(1))
            .await
            .unwrap();

        // Take the first task out, as an early settlement does, and schedule
        // the same settlement again before the first one finishes.
        let first = settlements.tasks.lock().await.remove(&hash).unwrap();
        settlements.schedule(&settlement).await;
        assert!(settlements.is_scheduled(&hash).await);

        first.task.trigger_now();
        first.task.await.unwrap().unwrap();
        assert!(Participant::status(&participants, &hash).await.unwrap().paid);

        // The newer task is still tracked, so it can be settled or cancelled.
        assert!(settlements.is_scheduled(&hash).await);
        settlements.settle_now(&hash).await.unwrap();
        assert!(!settlements.is_scheduled(&hash).await);
    }

    #[backend_test]
    async fn overdue_settlement_applies_on_start(db: Database, participants: Coll<Participant>) {
        let hash = registered(&db).await;
        let pending = Coll::<PendingSettlement>::from_db(&db);
        PendingSettlement::record(&pending, &hash, Duration::seconds(-10))
            .await
            .unwrap();

        let settlements = PaymentSettlements::new(&db);
        settlements.schedule_pending().await.unwrap();
        sleep(StdDuration::from_millis(500)).await;

        assert!(Participant::status(&participants, &hash).await.unwrap().paid);
    }
}
