use mongodb::{bson::de::Error as BsonError, error::Error as DbError};
use rocket::{
    http::Status,
    response::{self, status::Custom, Responder},
    serde::json::Json,
    Request,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Message shown for every ineligible vote, whatever the reason.
pub const VOTE_NOT_AUTHORISED: &str = "Vote not authorised";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Bson(#[from] BsonError),
    #[error("Internal error: {0}")]
    Internal(String),
    /// Missing or malformed input.
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// The identity is not registered, has not paid, or has already voted.
    /// Deliberately carries no detail.
    #[error("{}", VOTE_NOT_AUTHORISED)]
    VoteNotAuthorised,
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Self::Db(_) | Self::Bson(_) | Self::Internal(_) => Status::InternalServerError,
            Self::BadRequest(_) => Status::BadRequest,
            Self::VoteNotAuthorised => Status::Forbidden,
        }
    }

    /// The message safe to show to the client.
    fn public_message(&self) -> String {
        match self {
            Self::Db(_) | Self::Bson(_) | Self::Internal(_) => "Internal server error".to_string(),
            Self::BadRequest(msg) => msg.clone(),
            Self::VoteNotAuthorised => VOTE_NOT_AUTHORISED.to_string(),
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let status = self.status();
        if status.code >= 500 {
            error!("{self}");
        } else {
            debug!("{self}");
        }
        let body = ErrorBody {
            error: self.public_message(),
        };
        Custom(status, Json(body)).respond_to(req)
    }
}
