use chrono::{DateTime, Duration, Utc};
use mongodb::{
    bson::{doc, serde_helpers::chrono_datetime_as_bson_datetime},
    options::{FindOneAndUpdateOptions, ReturnDocument},
};
use rocket::futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    model::{common::identity::IdentityHash, mongodb::Coll},
};

/// A simulated payment that has been approved but not yet settled.
/// Persisted so that settlement survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSettlement {
    pub identity_hash: IdentityHash,
    /// When the participant should be marked as paid.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub settle_at: DateTime<Utc>,
}

impl PendingSettlement {
    /// Record a settlement for this identity due after `delay`, unless one is
    /// already pending, in which case the existing one is kept unchanged.
    /// Returns whichever settlement is now pending.
    pub async fn record(
        pending: &Coll<PendingSettlement>,
        identity_hash: &IdentityHash,
        delay: Duration,
    ) -> Result<Self> {
        let settle_at = Utc::now() + delay;
        let filter = doc! { "identity_hash": identity_hash };
        let update = doc! {
            "$setOnInsert": { "settle_at": settle_at },
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        pending
            .find_one_and_update(filter, update, options)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!(
                    "Pending settlement for {} vanished after upsert",
                    identity_hash.short()
                ))
            })
    }

    /// Forget the pending settlement for this identity.
    pub async fn remove(
        pending: &Coll<PendingSettlement>,
        identity_hash: &IdentityHash,
    ) -> Result<()> {
        pending
            .delete_one(doc! { "identity_hash": identity_hash }, None)
            .await?;
        Ok(())
    }

    /// All settlements still waiting to be applied.
    pub async fn all(pending: &Coll<PendingSettlement>) -> Result<Vec<Self>> {
        Ok(pending.find(None, None).await?.try_collect().await?)
    }
}
