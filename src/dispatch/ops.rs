use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::outcome::{Failure, Outcome, Payload};
use crate::hex::HexDisplayExt;
use crate::model::{QueryBuilder, Trip, User};

/// The business operations a command can invoke. This is the only seam
/// between dispatch and whatever stores users and trips.
///
/// Implementations never fail across this boundary: a refused or broken
/// operation is reported as an [`Outcome::Failure`]. Operations other than
/// `join` default to [`Failure::Unimplemented`] so a partial provider still
/// answers every command explicitly.
#[async_trait]
pub trait Operations: Send + Sync {
    async fn join(&self, username: &str, password_hash: &str) -> Outcome;

    async fn unjoin(&self, _username: &str) -> Outcome {
        Outcome::unimplemented("unjoin")
    }

    async fn register_user(&self, _user: User) -> Outcome {
        Outcome::unimplemented("register_user")
    }

    async fn insert_trip(&self, _trip: Trip) -> Outcome {
        Outcome::unimplemented("insert_trip")
    }

    async fn search_trip(&self, _query: QueryBuilder) -> Outcome {
        Outcome::unimplemented("search_trip")
    }
}

#[derive(Default)]
struct Store {
    users: HashMap<String, User>,
    online: HashSet<String>,
    trips: Vec<Trip>,
    last_user_id: u64,
    last_trip_id: u64,
}

/// Keeps users and trips in memory. Good enough for a single node that
/// doesn't need to survive a restart, and for tests.
#[derive(Default)]
pub struct MemoryOperations {
    store: RwLock<Store>,
}

impl MemoryOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_online(&self, username: &str) -> bool {
        self.store.read().await.online.contains(username)
    }

    pub async fn trip_count(&self) -> usize {
        self.store.read().await.trips.len()
    }
}

#[async_trait]
impl Operations for MemoryOperations {
    async fn join(&self, username: &str, password_hash: &str) -> Outcome {
        let mut store = self.store.write().await;
        let authenticated = store
            .users
            .get(username)
            .map_or(false, |user| user.password_hash() == password_hash);
        if !authenticated {
            debug!("rejected login for {}", username);
            return Outcome::failed("invalid username or password");
        }
        store.online.insert(username.to_owned());
        debug!("{} logged in", username);
        Outcome::Success(Payload::LoginOk {
            username: username.to_owned(),
        })
    }

    async fn unjoin(&self, username: &str) -> Outcome {
        if !self.store.write().await.online.remove(username) {
            return Outcome::failed(format!("{} is not logged in", username));
        }
        debug!("{} logged out", username);
        Outcome::Success(Payload::LoggedOut {
            username: username.to_owned(),
        })
    }

    async fn register_user(&self, mut user: User) -> Outcome {
        if user.username.is_empty() {
            return Outcome::failed("username is required");
        }
        if !user.has_password() {
            return Outcome::failed("password is required");
        }
        let mut store = self.store.write().await;
        if store.users.contains_key(&user.username) {
            return Outcome::failed(format!("username {} is taken", user.username));
        }
        store.last_user_id += 1;
        user.id = store.last_user_id;
        debug!("registered user {} as #{}", user.username, user.id);
        let user_id = user.id;
        store.users.insert(user.username.clone(), user);
        Outcome::Success(Payload::UserRegistered { user_id })
    }

    async fn insert_trip(&self, mut trip: Trip) -> Outcome {
        if trip.departure.is_unset() {
            return Outcome::Failure(Failure::InvalidLocation);
        }
        let mut store = self.store.write().await;
        if !store.users.contains_key(&trip.owner) {
            return Outcome::failed(format!("unknown trip owner {}", trip.owner));
        }
        store.last_trip_id += 1;
        trip.id = store.last_trip_id;
        debug!("stored trip #{} for {}", trip.id, trip.owner);
        let trip_id = trip.id;
        store.trips.push(trip);
        Outcome::Success(Payload::TripInserted { trip_id })
    }

    async fn search_trip(&self, query: QueryBuilder) -> Outcome {
        if query.departure.is_unset() {
            return Outcome::Failure(Failure::InvalidLocation);
        }
        let query_id = query.id();
        let trips = self
            .store
            .read()
            .await
            .trips
            .iter()
            .filter(|trip| match query.matches(trip) {
                Ok(matched) => matched,
                Err(_) => {
                    trace!("query {} skips trip #{} without coordinates", query_id.hex(), trip.id);
                    false
                }
            })
            .cloned()
            .collect::<Vec<_>>();
        debug!("query {} matched {} trips", query_id.hex(), trips.len());
        Outcome::Success(Payload::TripsFound { query_id, trips })
    }
}
