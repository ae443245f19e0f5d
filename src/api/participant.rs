use rocket::{serde::json::Json, Route};

use crate::{
    error::Result,
    logging::RequestId,
    model::{
        api::{
            participant::{IdentityRequest, ParticipantStatus},
            Ack,
        },
        db::participant::{NewParticipant, Participant},
        mongodb::Coll,
    },
};

pub fn routes() -> Vec<Route> {
    routes![register, status]
}

#[post("/register", data = "<request>", format = "json")]
async fn register(
    id: RequestId,
    request: Json<IdentityRequest>,
    participants: Coll<NewParticipant>,
) -> Result<Json<Ack>> {
    let identity_hash = request.0.identity()?.hash();
    Participant::register_if_absent(&participants, &identity_hash).await?;
    debug!("{id} registration for {}", identity_hash.short());
    Ok(Json(Ack::ok()))
}

/// Unregistered identities are reported as unpaid and not voted, so this
/// never reveals whether an identity is registered.
#[post("/status", data = "<request>", format = "json")]
async fn status(
    request: Json<IdentityRequest>,
    participants: Coll<Participant>,
) -> Result<Json<ParticipantStatus>> {
    let identity_hash = request.0.identity()?.hash();
    let status = Participant::status(&participants, &identity_hash).await?;
    Ok(Json(status))
}
