use std::ops::Deref;

use mongodb::{bson::doc, options::UpdateOptions};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    model::{
        api::participant::ParticipantStatus,
        common::{eligibility::ParticipantState, identity::IdentityHash},
        mongodb::{is_duplicate_key_error, Coll, Id},
    },
};

/// Core participant data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantCore {
    /// Participant unique key: the hash of their identity.
    pub identity_hash: IdentityHash,
    /// Whether their (simulated) payment has settled. Never reverts.
    pub paid: bool,
    /// Whether they have cast their vote. Never reverts.
    pub voted: bool,
}

impl ParticipantCore {
    /// A freshly registered participant.
    pub fn new(identity_hash: IdentityHash) -> Self {
        Self {
            identity_hash,
            paid: false,
            voted: false,
        }
    }

    pub fn state(&self) -> ParticipantState {
        ParticipantState::from_flags(Some((self.paid, self.voted)))
    }
}

/// A participant without an ID.
pub type NewParticipant = ParticipantCore;

/// A participant from the database, with its unique ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub participant: ParticipantCore,
}

impl Deref for Participant {
    type Target = ParticipantCore;

    fn deref(&self) -> &Self::Target {
        &self.participant
    }
}

impl Participant {
    /// Create the participant for this identity unless one already exists.
    /// Re-registering is a no-op, not an error.
    pub async fn register_if_absent(
        participants: &Coll<NewParticipant>,
        identity_hash: &IdentityHash,
    ) -> Result<()> {
        // The upserted document takes `identity_hash` from the filter.
        let filter = doc! { "identity_hash": identity_hash };
        let update = doc! {
            "$setOnInsert": {
                "paid": false,
                "voted": false,
            }
        };
        let options = UpdateOptions::builder().upsert(true).build();
        match participants.update_one(filter, update, options).await {
            Ok(result) => {
                if result.upserted_id.is_some() {
                    debug!("Registered participant {}", identity_hash.short());
                }
                Ok(())
            }
            // A concurrent registration of the same identity won the upsert.
            Err(err) if is_duplicate_key_error(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Mark the participant with this identity as paid.
    /// Does nothing if there is no such participant or they have already paid.
    pub async fn mark_paid(
        participants: &Coll<Participant>,
        identity_hash: &IdentityHash,
    ) -> Result<()> {
        let filter = doc! { "identity_hash": identity_hash };
        let update = doc! { "$set": { "paid": true } };
        let result = participants.update_one(filter, update, None).await?;
        if result.matched_count == 0 {
            debug!(
                "Settled payment for unregistered identity {}",
                identity_hash.short()
            );
        }
        Ok(())
    }

    /// Find the participant with this identity, if registered.
    pub async fn find_by_identity(
        participants: &Coll<Participant>,
        identity_hash: &IdentityHash,
    ) -> Result<Option<Self>> {
        let filter = doc! { "identity_hash": identity_hash };
        Ok(participants.find_one(filter, None).await?)
    }

    /// The participant's flags, or both false if they are not registered.
    pub async fn status(
        participants: &Coll<Participant>,
        identity_hash: &IdentityHash,
    ) -> Result<ParticipantStatus> {
        let status = Self::find_by_identity(participants, identity_hash)
            .await?
            .map(|p| ParticipantStatus {
                paid: p.paid,
                voted: p.voted,
            })
            .unwrap_or_default();
        Ok(status)
    }

    /// The eligibility state of this identity, including `Unregistered`.
    pub async fn state_of(
        participants: &Coll<Participant>,
        identity_hash: &IdentityHash,
    ) -> Result<ParticipantState> {
        Ok(Self::find_by_identity(participants, identity_hash)
            .await?
            .map_or(ParticipantState::Unregistered, |p| p.state()))
    }
}

#[cfg(test)]
mod tests {
    use mongodb::Database;

    use super::*;
    use crate::model::common::identity::Identity;

    #[backend_test]
    async fn register_twice_creates_one_participant(
        new_participants: Coll<NewParticipant>,
        participants: Coll<Participant>,
    ) {
        let hash = Identity::example().hash();
        Participant::register_if_absent(&new_participants, &hash)
            .await
            .unwrap();
        Participant::register_if_absent(&new_participants, &hash)
            .await
            .unwrap();

        let count = participants
            .count_documents(doc! { "identity_hash": &hash }, None)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let participant = Participant::find_by_identity(&participants, &hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(participant.participant, NewParticipant::new(hash));
    }

    #[backend_test]
    async fn reregistering_keeps_flags(
        new_participants: Coll<NewParticipant>,
        participants: Coll<Participant>,
    ) {
        let hash = Identity::example().hash();
        Participant::register_if_absent(&new_participants, &hash)
            .await
            .unwrap();
        Participant::mark_paid(&participants, &hash).await.unwrap();
        Participant::register_if_absent(&new_participants, &hash)
            .await
            .unwrap();

        let status = Participant::status(&participants, &hash).await.unwrap();
        assert_eq!(
            status,
            ParticipantStatus {
                paid: true,
                voted: false
            }
        );
    }

    #[backend_test]
    async fn unregistered_status_is_all_false(db: Database) {
        let participants = Coll::<Participant>::from_db(&db);
        for n in 0..5 {
            let hash = Identity::example_n(n).hash();
            let status = Participant::status(&participants, &hash).await.unwrap();
            assert_eq!(status, ParticipantStatus::default());
            assert_eq!(
                Participant::state_of(&participants, &hash).await.unwrap(),
                ParticipantState::Unregistered
            );
        }
    }

    #[backend_test]
    async fn mark_paid_for_unregistered_is_noop(participants: Coll<Participant>) {
        let hash = Identity::example().hash();
        Participant::mark_paid(&participants, &hash).await.unwrap();

        let count = participants.count_documents(None, None).await.unwrap();
        assert_eq!(count, 0);
    }

    #[backend_test]
    async fn mark_paid_is_idempotent(
        new_participants: Coll<NewParticipant>,
        participants: Coll<Participant>,
    ) {
        let hash = Identity::example().hash();
        Participant::register_if_absent(&new_participants, &hash)
            .await
            .unwrap();
        Participant::mark_paid(&participants, &hash).await.unwrap();
        Participant::mark_paid(&participants, &hash).await.unwrap();

        assert_eq!(
            Participant::state_of(&participants, &hash).await.unwrap(),
            ParticipantState::Paid
        );
    }
}
