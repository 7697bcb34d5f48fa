// Plain records exchanged between users and service nodes. All of them are
// archived with rkyv so they can ride inside a command frame. Timestamps are
// microseconds since the unix epoch, as on the wire.

use std::fmt;

use arrayref::array_ref;
use chrono::{DateTime, Utc};
use rkyv::{Archive, Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::geo::{self, Location, LocationRange};

mod password;

pub use password::{Blake3Hasher, PasswordHasher};

/// Converts a wire timestamp back into a date, if it is in range.
pub fn timestamp_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
}

#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Sex {
    Female,
    Male,
}

/// A registered user. The password is only ever held as a digest: it is
/// hashed by [`User::set_password`] and the plaintext is dropped there.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq, TypedBuilder)]
#[archive(check_bytes)]
pub struct User {
    #[builder(default)]
    pub id: u64,
    #[builder(setter(into))]
    pub username: String,
    #[builder(default, setter(skip))]
    password_hash: String,
    #[builder(default, setter(into))]
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub sex: Option<Sex>,
    #[builder(default)]
    pub birth_date: i64,
    #[builder(default, setter(into))]
    pub email: String,
    #[builder(default)]
    pub smoker: bool,
    #[builder(default = Utc::now().timestamp_micros())]
    pub signup_date: i64,
    /// Free text, e.g. the neighbourhood the user usually leaves from.
    #[builder(default, setter(into))]
    pub whereabouts: String,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_username(name, String::new())
    }

    pub fn with_username(name: impl Into<String>, username: impl Into<String>) -> Self {
        Self::builder().username(username).name(name).build()
    }

    pub fn set_password(&mut self, hasher: &dyn PasswordHasher, plaintext: &str) {
        self.password_hash = hasher.hash(plaintext);
    }

    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }

    pub fn has_password(&self) -> bool {
        !self.password_hash.is_empty()
    }
}

/// A trip offered by its owner. Trips are stored by the operations provider
/// of the node the owner registered them with.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq, TypedBuilder)]
#[archive(check_bytes)]
pub struct Trip {
    #[builder(default)]
    pub id: u64,
    #[builder(setter(into))]
    pub owner: String,
    pub departure: Location,
    #[builder(default)]
    pub departure_time: i64,
    pub arrival: Location,
    #[builder(default)]
    pub arrival_time: i64,
    #[builder(default)]
    pub smoke: bool,
    #[builder(default)]
    pub music: bool,
    #[builder(default)]
    pub cost: f64,
    #[builder(default)]
    pub free_seats: u32,
    #[builder(default, setter(into))]
    pub notes: String,
    #[builder(default = true)]
    pub modifiable: bool,
}

impl Trip {
    pub fn departure_name(&self) -> Option<&str> {
        self.departure.name()
    }

    pub fn arrival_name(&self) -> Option<&str> {
        self.arrival.name()
    }
}

impl fmt::Display for Trip {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let when = |micros| {
            timestamp_to_datetime(micros)
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| "?".into())
        };
        writeln!(f, "trip #{} by {}", self.id, self.owner)?;
        writeln!(f, "  departure:  {} at {}", self.departure, when(self.departure_time))?;
        writeln!(f, "  arrival:    {} at {}", self.arrival, when(self.arrival_time))?;
        writeln!(f, "  smoke:      {}", self.smoke)?;
        writeln!(f, "  music:      {}", self.music)?;
        writeln!(f, "  cost:       {:.2}", self.cost)?;
        writeln!(f, "  free seats: {}", self.free_seats)?;
        writeln!(f, "  modifiable: {}", self.modifiable)?;
        write!(f, "  notes:      {}", self.notes)
    }
}

pub type QueryID = [u8; 8];

/// Parameters of a trip search. Shaped like a [`Trip`], but describing a set
/// of trips: anything leaving within `range_km` of `departure` (and arriving
/// within `range_km` of `arrival`, when that is set).
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq, TypedBuilder)]
#[archive(check_bytes)]
pub struct QueryBuilder {
    #[builder(default = Utc::now().timestamp_micros())]
    pub created_at: i64,
    /// Restricts results to trips offered by this user.
    #[builder(default, setter(strip_option))]
    pub owner: Option<String>,
    pub range_km: f64,
    pub departure: Location,
    #[builder(default)]
    pub departure_time: i64,
    #[builder(default)]
    pub arrival: Location,
    #[builder(default)]
    pub arrival_time: i64,
    #[builder(default)]
    pub smoke: bool,
    #[builder(default)]
    pub music: bool,
    /// Highest acceptable cost. Zero means any.
    #[builder(default)]
    pub cost: f64,
    /// Seats the searcher needs.
    #[builder(default)]
    pub free_seats: u32,
    #[builder(default, setter(into))]
    pub notes: String,
}

impl QueryBuilder {
    /// Correlates a search with its eventual result. Derived from the
    /// creation time, owner and place names, so it is not a storage key.
    pub fn id(&self) -> QueryID {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.created_at.to_le_bytes());
        for part in [
            self.owner.as_deref(),
            self.departure.name(),
            self.arrival.name(),
        ] {
            hasher.update(part.unwrap_or_default().as_bytes());
            hasher.update(&[0]);
        }
        let digest = hasher.finalize();
        *array_ref![digest.as_bytes(), 0, 8]
    }

    pub fn departure_range(&self) -> LocationRange {
        LocationRange::from_kilometers(self.departure.clone(), self.range_km)
    }

    /// `None` when the query doesn't constrain the arrival.
    pub fn arrival_range(&self) -> Option<LocationRange> {
        if self.arrival.is_unset() {
            None
        } else {
            Some(LocationRange::from_kilometers(self.arrival.clone(), self.range_km))
        }
    }

    /// Fails with `InvalidLocation` if the query departure or a location the
    /// trip must be checked against has no coordinates.
    pub fn matches(&self, trip: &Trip) -> Result<bool, geo::Error> {
        if let Some(owner) = &self.owner {
            if owner != &trip.owner {
                return Ok(false);
            }
        }
        if trip.free_seats < self.free_seats {
            return Ok(false);
        }
        if self.cost > 0. && trip.cost > self.cost {
            return Ok(false);
        }
        if !self.departure_range().contains(&trip.departure)? {
            return Ok(false);
        }
        match self.arrival_range() {
            Some(range) => range.contains(&trip.arrival),
            None => Ok(true),
        }
    }
}
