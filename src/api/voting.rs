use mongodb::Client as MongoClient;
use rocket::{serde::json::Json, Route, State};

use crate::{
    error::Result,
    logging::RequestId,
    model::{
        api::{vote::VoteRequest, Ack},
        db::{participant::Participant, vote::Vote},
        mongodb::Coll,
    },
};

pub fn routes() -> Vec<Route> {
    routes![vote]
}

#[post("/vote", data = "<request>", format = "json")]
async fn vote(
    id: RequestId,
    request: Json<VoteRequest>,
    db_client: &State<MongoClient>,
    participants: Coll<Participant>,
    votes: Coll<Vote>,
) -> Result<Json<Ack>> {
    let (identity, selections) = request.0.validate()?;
    let identity_hash = identity.hash();
    let vote = Vote::cast(db_client, &participants, &votes, &identity_hash, &selections).await?;
    info!("{id} recorded vote {}", vote.id);
    Ok(Json(Ack::ok()))
}

#[cfg(test)]
mod tests {
    use mongodb::bson::doc;
    use rocket::{
        futures::future::join,
        http::{ContentType, Status},
        local::asynchronous::{Client, LocalRequest, LocalResponse},
    };

    use super::*;
    use crate::{
        error::{ErrorBody, VOTE_NOT_AUTHORISED},
        model::{
            api::{
                participant::{IdentityRequest, ParticipantStatus},
                tally::ChoiceTotal,
            },
            common::identity::Identity,
        },
        payment::PaymentSettlements,
    };

    async fn post_identity(client: &Client, path: &str, identity: &Identity) -> Status {
        client
            .post(path.to_string())
            .header(ContentType::JSON)
            .json(&IdentityRequest::for_identity(identity))
            .dispatch()
            .await
            .status()
    }

    fn post_vote<'c>(
        client: &'c Client,
        identity: &Identity,
        first: &str,
        second: &str,
    ) -> LocalRequest<'c> {
        client
            .post("/api/vote")
            .header(ContentType::JSON)
            .json(&VoteRequest::for_identity(identity, first, second))
    }

    async fn assert_rejected(response: LocalResponse<'_>) {
        assert_eq!(Status::Forbidden, response.status());
        let body: ErrorBody = response.into_json().await.unwrap();
        assert_eq!(body.error, VOTE_NOT_AUTHORISED);
    }

    /// Register and pay for the given identity, settling immediately.
    async fn paid_participant(client: &Client, identity: &Identity) {
        assert_eq!(
            Status::Ok,
            post_identity(client, "/api/register", identity).await
        );
        assert_eq!(
            Status::Ok,
            post_identity(client, "/api/payment", identity).await
        );
        client
            .rocket()
            .state::<PaymentSettlements>()
            .unwrap()
            .settle_now(&identity.hash())
            .await
            .unwrap();
    }

    async fn status(client: &Client, identity: &Identity) -> ParticipantStatus {
        client
            .post("/api/status")
            .header(ContentType::JSON)
            .json(&IdentityRequest::for_identity(identity))
            .dispatch()
            .await
            .into_json()
            .await
            .unwrap()
    }

    #[backend_test]
    async fn full_flow(client: Client) {
        let identity = Identity::example();

        post_identity(&client, "/api/register", &identity).await;
        assert_eq!(
            status(&client, &identity).await,
            ParticipantStatus {
                paid: false,
                voted: false
            }
        );

        post_identity(&client, "/api/payment", &identity).await;
        client
            .rocket()
            .state::<PaymentSettlements>()
            .unwrap()
            .settle_now(&identity.hash())
            .await
            .unwrap();
        assert_eq!(
            status(&client, &identity).await,
            ParticipantStatus {
                paid: true,
                voted: false
            }
        );

        let response = post_vote(&client, &identity, "X", "Y").dispatch().await;
        assert_eq!(Status::Ok, response.status());
        assert_eq!(response.into_json::<Ack>().await.unwrap(), Ack::ok());
        assert_eq!(
            status(&client, &identity).await,
            ParticipantStatus {
                paid: true,
                voted: true
            }
        );

        let again = post_vote(&client, &identity, "X", "Y").dispatch().await;
        assert_rejected(again).await;

        let results = client.get("/api/results").dispatch().await;
        assert_eq!(Status::Ok, results.status());
        let totals: Vec<ChoiceTotal> = results.into_json().await.unwrap();
        assert_eq!(totals, vec![ChoiceTotal::new("X", 1)]);
    }

    #[backend_test]
    async fn unregistered_is_rejected(client: Client, votes: Coll<Vote>) {
        let response = post_vote(&client, &Identity::example(), "X", "Y")
            .dispatch()
            .await;
        assert_rejected(response).await;
        assert_eq!(votes.count_documents(None, None).await.unwrap(), 0);
    }

    #[backend_test]
    async fn unpaid_is_rejected_regardless_of_retries(client: Client, votes: Coll<Vote>) {
        let identity = Identity::example();
        post_identity(&client, "/api/register", &identity).await;
        post_identity(&client, "/api/payment", &identity).await;

        // The settlement delay has not elapsed yet.
        for _ in 0..3 {
            let response = post_vote(&client, &identity, "X", "Y").dispatch().await;
            assert_rejected(response).await;
        }
        assert_eq!(votes.count_documents(None, None).await.unwrap(), 0);
        assert!(!status(&client, &identity).await.voted);
    }

    #[backend_test]
    async fn missing_choice_is_bad_request(client: Client, participants: Coll<Participant>) {
        let identity = Identity::example();
        paid_participant(&client, &identity).await;

        let response = post_vote(&client, &identity, "", "Y").dispatch().await;
        assert_eq!(Status::BadRequest, response.status());

        // Still eligible afterwards.
        let hash = identity.hash();
        let count = participants
            .count_documents(doc! { "identity_hash": &hash, "voted": false }, None)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[backend_test]
    async fn simultaneous_votes_record_one(client: Client, votes: Coll<Vote>) {
        let identity = Identity::example();
        paid_participant(&client, &identity).await;

        let (first, second) = join(
            post_vote(&client, &identity, "X", "Y").dispatch(),
            post_vote(&client, &identity, "Z", "Y").dispatch(),
        )
        .await;
        let mut statuses = [first.status(), second.status()];
        statuses.sort_by_key(|s| s.code);
        assert_eq!(statuses, [Status::Ok, Status::Forbidden]);

        assert_eq!(votes.count_documents(None, None).await.unwrap(), 1);
        assert!(status(&client, &identity).await.voted);
    }
}
