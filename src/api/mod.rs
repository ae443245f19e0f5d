use rocket::Route;

mod participant;
mod payment;
mod results;
mod voting;

/// Base path all API routes are mounted under.
pub const API_BASE: &str = "/api";

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(participant::routes());
    routes.extend(payment::routes());
    routes.extend(voting::routes());
    routes.extend(results::routes());
    routes
}
