use rocket::{serde::json::Json, Route, State};

use crate::{
    config::Config,
    error::Result,
    logging::RequestId,
    model::api::{participant::IdentityRequest, payment::PaymentReceipt},
    payment::PaymentSettlements,
};

pub fn routes() -> Vec<Route> {
    routes![simulate_payment]
}

/// Approve a simulated payment. The receipt is returned straight away, but
/// the participant only becomes paid once the settlement delay has elapsed.
#[post("/payment", data = "<request>", format = "json")]
async fn simulate_payment(
    id: RequestId,
    request: Json<IdentityRequest>,
    config: &State<Config>,
    settlements: &State<PaymentSettlements>,
) -> Result<Json<PaymentReceipt>> {
    let identity_hash = request.0.identity()?.hash();
    let settlement = settlements
        .approve(&identity_hash, config.payment_delay())
        .await?;
    debug!(
        "{id} payment for {} settles at {}",
        identity_hash.short(),
        settlement.settle_at
    );
    Ok(Json(PaymentReceipt {
        amount: config.payment_amount(),
        message: config.payment_message().to_string(),
    }))
}
