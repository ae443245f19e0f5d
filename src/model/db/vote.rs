use std::ops::Deref;
use std::time::Duration;

use mongodb::{
    bson::{doc, from_document, Document},
    Client,
};
use rocket::{futures::TryStreamExt, tokio::time::sleep};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    model::{
        api::{tally::ChoiceTotal, vote::Selections},
        common::{eligibility::ParticipantState, identity::IdentityHash},
        db::participant::Participant,
        mongodb::{
            is_duplicate_key_error, is_transient_transaction_error, is_unknown_commit_result,
            Coll, Id,
        },
    },
};

/// How many times a conflicting vote transaction is attempted before giving up.
const MAX_TRANSACTION_ATTEMPTS: u32 = 5;

/// Pause between transaction attempts, multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Core vote data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCore {
    /// Foreign key participant ID. Unique: one vote per participant.
    pub participant_id: Id,
    pub first_choice: String,
    pub second_choice: String,
}

/// A vote from the database, with its unique ID.
/// Votes are immutable once inserted and never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub vote: VoteCore,
}

impl Deref for Vote {
    type Target = VoteCore;

    fn deref(&self) -> &Self::Target {
        &self.vote
    }
}

impl Vote {
    /// Cast a vote for the participant with this identity.
    ///
    /// The participant must be paid and not yet voted. Claiming the vote
    /// (setting `voted`) and recording it happen in one transaction, so a vote
    /// exists iff its participant is marked as voted. Every ineligible case is
    /// reported as the same [`Error::VoteNotAuthorised`].
    pub async fn cast(
        db_client: &Client,
        participants: &Coll<Participant>,
        votes: &Coll<Vote>,
        identity_hash: &IdentityHash,
        selections: &Selections,
    ) -> Result<Vote> {
        let mut attempt = 1;
        loop {
            let result =
                Self::cast_once(db_client, participants, votes, identity_hash, selections).await;
            match result {
                Err(Error::Db(ref err))
                    if is_transient_transaction_error(err) && attempt < MAX_TRANSACTION_ATTEMPTS =>
                {
                    debug!(
                        "Vote transaction for {} conflicted (attempt {attempt}), retrying",
                        identity_hash.short()
                    );
                    sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                // The unique index caught a second vote for this participant.
                Err(Error::Db(ref err)) if is_duplicate_key_error(err) => {
                    Self::log_rejection(participants, identity_hash).await;
                    return Err(Error::VoteNotAuthorised);
                }
                Err(Error::VoteNotAuthorised) => {
                    Self::log_rejection(participants, identity_hash).await;
                    return Err(Error::VoteNotAuthorised);
                }
                // Out of attempts, most likely against a competing vote.
                Err(Error::Db(err)) if is_transient_transaction_error(&err) => {
                    return Err(
                        Self::resolve_conflict(participants, identity_hash, err.into()).await,
                    );
                }
                other => return other,
            }
        }
    }

    /// Decide the outcome of a vote whose transaction kept conflicting.
    /// If the participant has voted in the meantime, a competing vote won and
    /// this one is rejected like any other ineligible vote; otherwise the
    /// original error stands.
    async fn resolve_conflict(
        participants: &Coll<Participant>,
        identity_hash: &IdentityHash,
        err: Error,
    ) -> Error {
        match Participant::state_of(participants, identity_hash).await {
            Ok(ParticipantState::Voted) => {
                debug!(
                    "Vote for {} lost to a concurrent vote: {err}",
                    identity_hash.short()
                );
                Error::VoteNotAuthorised
            }
            _ => err,
        }
    }

    /// A single attempt at the vote transaction.
    async fn cast_once(
        db_client: &Client,
        participants: &Coll<Participant>,
        votes: &Coll<Vote>,
        identity_hash: &IdentityHash,
        selections: &Selections,
    ) -> Result<Vote> {
        let mut session = db_client.start_session(None).await?;
        session.start_transaction(None).await?;

        // Atomically check eligibility and claim the vote.
        let claim = doc! { "$set": { "voted": true } };
        let claimed = participants
            .find_one_and_update_with_session(
                ParticipantState::may_vote_filter(identity_hash),
                claim,
                None,
                &mut session,
            )
            .await?;
        let participant = match claimed {
            Some(participant) => participant,
            None => {
                session.abort_transaction().await?;
                return Err(Error::VoteNotAuthorised);
            }
        };

        // Record the vote.
        let vote = Vote {
            id: Id::new(),
            vote: VoteCore {
                participant_id: participant.id,
                first_choice: selections.first().to_string(),
                second_choice: selections.second().to_string(),
            },
        };
        votes
            .insert_one_with_session(&vote, None, &mut session)
            .await?;

        let mut commit_attempt = 1;
        loop {
            match session.commit_transaction().await {
                Ok(()) => break,
                Err(err)
                    if is_unknown_commit_result(&err)
                        && commit_attempt < MAX_TRANSACTION_ATTEMPTS =>
                {
                    commit_attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(vote)
    }

    /// Log why a vote was rejected. The reason is never shown to the caller.
    async fn log_rejection(participants: &Coll<Participant>, identity_hash: &IdentityHash) {
        match Participant::state_of(participants, identity_hash).await {
            Ok(state) => debug!("Vote rejected for {}: {state}", identity_hash.short()),
            Err(e) => debug!(
                "Vote rejected for {}, state unknown: {e}",
                identity_hash.short()
            ),
        }
    }

    /// Count the votes for each first-round choice, most votes first.
    pub async fn tally_first_round(votes: &Coll<Vote>) -> Result<Vec<ChoiceTotal>> {
        let pipeline = [
            doc! { "$group": { "_id": "$first_choice", "total": { "$sum": 1 } } },
            doc! { "$project": { "_id": 0, "choice": "$_id", "total": 1 } },
            doc! { "$sort": { "total": -1, "choice": 1 } },
        ];
        let documents: Vec<Document> = votes.aggregate(pipeline, None).await?.try_collect().await?;
        let totals = documents
            .into_iter()
            .map(from_document)
            .collect::<std::result::Result<Vec<ChoiceTotal>, _>>()?;
        Ok(totals)
    }
}
