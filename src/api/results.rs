use rocket::{serde::json::Json, Route};

use crate::{
    error::Result,
    model::{api::tally::ChoiceTotal, db::vote::Vote, mongodb::Coll},
};

pub fn routes() -> Vec<Route> {
    routes![results]
}

/// First-round totals, most votes first.
#[get("/results")]
async fn results(votes: Coll<Vote>) -> Result<Json<Vec<ChoiceTotal>>> {
    let totals = Vote::tally_first_round(&votes).await?;
    Ok(Json(totals))
}

#[cfg(test)]
mod tests {
    use rocket::{http::Status, local::asynchronous::Client};

    use super::*;
    use crate::model::{db::vote::VoteCore, mongodb::Id};

    #[backend_test]
    async fn no_votes_no_totals(client: Client) {
        let response = client.get("/api/results").dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let totals: Vec<ChoiceTotal> = response.into_json().await.unwrap();
        assert!(totals.is_empty());
    }

    #[backend_test]
    async fn totals_sum_to_votes(client: Client, votes: Coll<Vote>) {
        let firsts = ["B", "A", "B", "C", "B", "A"];
        let ballots = firsts.iter().map(|first| Vote {
            id: Id::new(),
            vote: VoteCore {
                participant_id: Id::new(),
                first_choice: first.to_string(),
                second_choice: "Z".to_string(),
            },
        });
        votes.insert_many(ballots, None).await.unwrap();

        let response = client.get("/api/results").dispatch().await;
        let totals: Vec<ChoiceTotal> = response.into_json().await.unwrap();
        assert_eq!(
            totals,
            vec![
                ChoiceTotal::new("B", 3),
                ChoiceTotal::new("A", 2),
                ChoiceTotal::new("C", 1),
            ]
        );
        let sum: u64 = totals.iter().map(|t| t.total).sum();
        assert_eq!(sum, firsts.len() as u64);
    }
}
