use chrono::Duration;
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    figment::{providers::Env, Figment},
    Build, Rocket,
};
use serde::Deserialize;

use crate::model::mongodb::ensure_indexes_exist;

/// Name of the production database.
pub const DATABASE_NAME: &str = "paidvote";

/// Rocket's usual configuration sources (`Rocket.toml`, `ROCKET_*` variables),
/// plus a bare `PORT` environment variable overriding the listening port as
/// hosting platforms expect.
pub fn figment() -> Figment {
    rocket::Config::figment().merge(Env::raw().only(&["port"]))
}

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    payment_delay_ms: u32,
    payment_amount: f64,
    payment_message: String,
    static_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            payment_delay_ms: 2000,
            payment_amount: 2.0,
            payment_message: "Simulated payment approved (demo)".to_string(),
            static_dir: "public".to_string(),
        }
    }
}

impl Config {
    /// Time between approving a simulated payment and marking the participant as paid.
    pub fn payment_delay(&self) -> Duration {
        Duration::milliseconds(self.payment_delay_ms.into())
    }

    /// Amount reported on every simulated payment.
    pub fn payment_amount(&self) -> f64 {
        self.payment_amount
    }

    /// Message reported on every simulated payment.
    pub fn payment_message(&self) -> &str {
        &self.payment_message
    }

    /// Directory of static front-end files, served at `/` if it exists.
    pub fn static_dir(&self) -> &str {
        &self.static_dir
    }
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the other fairings and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        debug!("Loaded application config: {config:?}");

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    db_uri: String,
}

/// A fairing that loads the MongoDB config, connects to the database,
/// performs any setup necessary, and places both a `Client` and a `Database`
/// into managed state.
///
/// An already-connected client can be supplied instead, in which case
/// `db_uri` is not read.
pub struct DatabaseFairing {
    client: Option<MongoClient>,
    database: String,
}

impl DatabaseFairing {
    /// Connect to the production database using `db_uri` from the config.
    pub fn new() -> Self {
        Self {
            client: None,
            database: DATABASE_NAME.to_string(),
        }
    }

    /// Use the given client and database name.
    pub fn with_client(client: MongoClient, database: &str) -> Self {
        Self {
            client: Some(client),
            database: database.to_string(),
        }
    }
}

impl Default for DatabaseFairing {
    fn default() -> Self {
        Self::new()
    }
}

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let client = match self.client {
            Some(ref client) => client.clone(),
            None => {
                // Load the config.
                let config = match rocket.figment().extract::<DbConfig>() {
                    Ok(config) => config,
                    Err(e) => {
                        error!("Failed to load database config");
                        rocket::config::pretty_print_error(e);
                        return Err(rocket);
                    }
                };
                info!("Loaded database config, connecting...");
                // Construct the connection.
                match MongoClient::with_uri_str(config.db_uri).await {
                    Ok(client) => client,
                    Err(e) => {
                        error!("Failed to connect to database: {e}");
                        return Err(rocket);
                    }
                }
            }
        };
        let db = client.database(&self.database);

        // Ensure the required indexes exist. This is also the first round trip,
        // so it doubles as a connectivity check.
        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to connect to database: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        // Manage the state.
        rocket = rocket.manage(client).manage(db);
        Ok(rocket)
    }
}
