#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

use crate::{
    config::{ConfigFairing, DatabaseFairing},
    logging::LoggerFairing,
    payment::PaymentSettlementFairing,
    web::{CorsFairing, StaticFilesFairing},
};

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod payment;
pub mod scheduled_task;
pub mod web;

/// Build the server against the production database.
pub fn build() -> Rocket<Build> {
    assemble(DatabaseFairing::new())
}

/// Attach every fairing and route. Fairing order matters: later fairings
/// read state managed by earlier ones.
fn assemble(database: DatabaseFairing) -> Rocket<Build> {
    rocket::custom(config::figment())
        .attach(LoggerFairing)
        .attach(CorsFairing)
        .attach(ConfigFairing)
        .attach(database)
        .attach(PaymentSettlementFairing)
        .attach(StaticFilesFairing)
        .mount(api::API_BASE, api::routes())
        .mount("/", web::routes())
        .register("/", web::catchers())
}

/// Connect to the database configured for tests.
#[cfg(test)]
async fn db_client() -> mongodb::Client {
    let db_uri = config::figment()
        .extract_inner::<String>("db_uri")
        .expect("`db_uri` not set");
    mongodb::Client::with_uri_str(&db_uri)
        .await
        .unwrap_or_else(|e| panic!("Could not connect to database with `db_uri` \"{db_uri}\": {e}"))
}

/// A fresh database name, unique to this test.
#[cfg(test)]
fn database() -> String {
    format!("test{}", rand::random::<u32>())
}

/// Build the server against the given database.
#[cfg(test)]
fn rocket_for_db(client: mongodb::Client, database: &str) -> Rocket<Build> {
    assemble(DatabaseFairing::with_client(client, database))
}
