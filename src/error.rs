use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::Request;
use serde::Serialize;
use tracing::{debug, error};

use crate::sd::WriteError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed body, bad target or label syntax.
    #[error("{0}")]
    Validation(String),

    /// POST would register an existing target or change no label.
    #[error("{0}")]
    Conflict(String),

    /// DELETE names something that is not registered.
    #[error("{0}")]
    NotFound(String),

    /// DELETE would orphan labels without any target.
    #[error("{0}")]
    Integrity(String),

    #[error("could not persist discovery file: {0}")]
    Persistence(#[from] WriteError),

    #[error("request was aborted before it could be committed: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn status(&self) -> Status {
        match self {
            Error::Validation(_) | Error::Conflict(_) | Error::NotFound(_) | Error::Integrity(_) => {
                Status::BadRequest
            }
            Error::Persistence(_) | Error::Aborted(_) => Status::InternalServerError,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct Message {
    pub message: String,
}

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status.class().is_server_error() {
            error!("{} {} failed: {}", req.method(), req.uri(), self);
        } else {
            debug!("{} {} rejected: {}", req.method(), req.uri(), self);
        }

        (
            status,
            Json(Message {
                message: self.to_string(),
            }),
        )
            .respond_to(req)
    }
}
