use rkyv::{Archive, Deserialize, Serialize};

use crate::geo;
use crate::model::{QueryID, Trip};

/// What a successful operation hands back.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum Payload {
    LoginOk { username: String },
    LoggedOut { username: String },
    UserRegistered { user_id: u64 },
    TripInserted { trip_id: u64 },
    TripsFound { query_id: QueryID, trips: Vec<Trip> },
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum Failure {
    /// The provider refused the operation.
    OperationFailed(String),
    /// The provider has no behaviour for this operation.
    Unimplemented(String),
    /// A location involved in the operation has no coordinates.
    InvalidLocation,
    /// The command was cancelled while in flight.
    Cancelled,
}

/// The tagged result of exactly one operation. Produced once per command and
/// never modified afterwards.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum Outcome {
    Success(Payload),
    Failure(Failure),
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failure(Failure::OperationFailed(reason.into()))
    }

    pub fn unimplemented(operation: &str) -> Self {
        Outcome::Failure(Failure::Unimplemented(operation.into()))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Outcome::Success(payload) => Some(payload),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(failure) => Some(failure),
        }
    }
}

impl From<geo::Error> for Outcome {
    fn from(error: geo::Error) -> Self {
        match error {
            geo::Error::InvalidLocation => Outcome::Failure(Failure::InvalidLocation),
        }
    }
}
