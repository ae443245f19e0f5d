//! Browser-facing plumbing: CORS headers and the static front-end.

use std::path::Path;

use rocket::{
    fairing::{Fairing, Info, Kind},
    fs::FileServer,
    http::{Header, Status},
    serde::json::Json,
    Build, Catcher, Request, Response, Rocket, Route,
};

use crate::{config::Config, error::ErrorBody};

/// Rank of the static file server, below every API route.
const STATIC_RANK: isize = 20;

pub fn routes() -> Vec<Route> {
    routes![preflight]
}

/// Answer CORS preflight requests for any path.
#[options("/<_..>")]
fn preflight() -> Status {
    Status::NoContent
}

pub fn catchers() -> Vec<Catcher> {
    catchers![default_catcher]
}

/// Render errors raised outside our handlers (unknown routes, unparseable
/// bodies) in the same JSON shape as our own.
#[catch(default)]
fn default_catcher(status: Status, _req: &Request) -> (Status, Json<ErrorBody>) {
    let body = ErrorBody {
        error: status.reason_lossy().to_string(),
    };
    (status, Json(body))
}

/// A fairing that allows cross-origin requests from any origin.
#[derive(Debug, Copy, Clone)]
pub struct CorsFairing;

#[rocket::async_trait]
impl Fairing for CorsFairing {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r Request<'_>, res: &mut Response<'r>) {
        res.set_header(Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST, OPTIONS",
        ));
        res.set_header(Header::new("Access-Control-Allow-Headers", "Content-Type"));
    }
}

/// A fairing that serves the configured static directory at `/`, if it exists.
/// This fairing depends on the config being available in managed state,
/// and so must be attached after the fairing responsible for that.
pub struct StaticFilesFairing;

#[rocket::async_trait]
impl Fairing for StaticFilesFairing {
    fn info(&self) -> Info {
        Info {
            name: "Static Files",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let dir = match rocket.state::<Config>() {
            Some(config) => config.static_dir().to_string(),
            None => {
                error!("Config was not available when mounting static files");
                return Err(rocket);
            }
        };
        if Path::new(&dir).is_dir() {
            info!("Serving static files from {dir}");
            Ok(rocket.mount("/", FileServer::from(dir).rank(STATIC_RANK)))
        } else {
            debug!("No static directory at {dir}, not serving static files");
            Ok(rocket)
        }
    }
}

#[cfg(test)]
mod tests {
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
    };

    use crate::error::ErrorBody;

    #[backend_test]
    async fn preflight_allows_any_origin(client: Client) {
        let response = client.options("/api/vote").dispatch().await;
        assert_eq!(Status::NoContent, response.status());
        let headers = response.headers();
        assert_eq!(headers.get_one("Access-Control-Allow-Origin"), Some("*"));
        assert_eq!(
            headers.get_one("Access-Control-Allow-Methods"),
            Some("GET, POST, OPTIONS")
        );
    }

    #[backend_test]
    async fn unknown_route_is_json(client: Client) {
        let response = client.get("/api/nowhere").dispatch().await;
        assert_eq!(Status::NotFound, response.status());
        assert_eq!(response.content_type(), Some(ContentType::JSON));
        let body: ErrorBody = response.into_json().await.unwrap();
        assert_eq!(body.error, "Not Found");
    }

    #[backend_test]
    async fn malformed_body_is_json(client: Client) {
        let response = client
            .post("/api/register")
            .header(ContentType::JSON)
            .body("not json")
            .dispatch()
            .await;
        assert_eq!(Status::BadRequest, response.status());
        assert!(response.into_json::<ErrorBody>().await.is_some());
    }
}
