use libm::acos;
use rkyv::{Archive, Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use thiserror::Error;

/// Mean earth radius used for every distance computed by the mesh.
pub const EARTH_RADIUS_KM: f64 = 6371.;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// One of the points was never given coordinates. `(0, 0)` is the unset
    /// sentinel, not a point in the gulf of Guinea.
    #[error("one of the locations has no coordinates")]
    InvalidLocation,
}

#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

/// A punctual location: latitude and longitude in degrees, optionally named.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq, Default)]
#[archive(check_bytes)]
pub struct Location {
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            name: None,
            latitude,
            longitude,
        }
    }

    /// A location known only by name. It can't take part in distance
    /// computations until coordinates are filled in.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_coordinates(
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            name: Some(name.into()),
            latitude,
            longitude,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_unset(&self) -> bool {
        self.latitude == 0. && self.longitude == 0.
    }

    /// Great-circle distance to `other`, via the spherical law of cosines.
    pub fn distance(&self, other: &Location) -> Result<Distance, Error> {
        if self.is_unset() || other.is_unset() {
            return Err(Error::InvalidLocation);
        }

        let pi_180 = |x: f64| (x * PI) / 180.;
        let (lat1, lat2) = (pi_180(self.latitude), pi_180(other.latitude));
        let d_lng = pi_180(other.longitude) - pi_180(self.longitude);

        let cos_c = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * d_lng.cos();
        // rounding can push coincident points just past 1
        let c = acos(cos_c.clamp(-1., 1.));

        Ok(Distance::from_kilometers(EARTH_RADIUS_KM * c))
    }

    /// Moves the point `distance` along a cardinal direction. East and west
    /// offsets are approximate away from the equator.
    pub fn offset(&self, distance: &Distance, direction: Direction) -> Self {
        let d = distance.kilometers() / EARTH_RADIUS_KM;
        let c = 180. / PI;

        match direction {
            Direction::East | Direction::West => {
                let offset = d * c / (self.latitude * PI / 180.).cos();
                let scalar = if direction == Direction::East { 1. } else { -1. };
                Self::new(self.latitude, self.longitude + (offset * scalar))
            }
            Direction::North | Direction::South => {
                let scalar = if direction == Direction::North { 1. } else { -1. };
                Self::new(self.latitude + (d * c * scalar), self.longitude)
            }
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({},{})", name, self.latitude, self.longitude),
            None => write!(f, "{},{}", self.latitude, self.longitude),
        }
    }
}

/// A circle on the globe: a center and a radius around it. Trip search uses
/// it to decide whether a departure or arrival point is close enough.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub struct LocationRange {
    pub center: Location,
    pub radius: Distance,
}

impl LocationRange {
    pub fn new(center: Location, radius: Distance) -> Self {
        Self { center, radius }
    }

    pub fn from_kilometers(center: Location, radius_km: f64) -> Self {
        Self::new(center, Distance::from_kilometers(radius_km))
    }

    /// True iff `other` lies strictly inside the range. A point exactly on
    /// the boundary is outside.
    pub fn contains(&self, other: &Location) -> Result<bool, Error> {
        let distance = self.center.distance(other)?;
        Ok(distance.kilometers() < self.radius.kilometers())
    }
}

#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize, PartialEq)]
#[archive(check_bytes)]
pub enum DistanceUnit {
    Meters,
    Kilometers,
}

impl DistanceUnit {
    fn in_meters(&self) -> f64 {
        match self {
            DistanceUnit::Meters => 1.,
            DistanceUnit::Kilometers => 1000.,
        }
    }

    fn abbreviation(&self) -> &'static str {
        match self {
            DistanceUnit::Meters => "m",
            DistanceUnit::Kilometers => "km",
        }
    }
}

#[derive(Debug, Clone, Copy, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct Distance {
    unit: DistanceUnit,
    value: f64,
}

impl Distance {
    pub fn from_kilometers(value: f64) -> Self {
        Self {
            value,
            unit: DistanceUnit::Kilometers,
        }
    }

    pub fn from_meters(value: f64) -> Self {
        Self {
            value,
            unit: DistanceUnit::Meters,
        }
    }

    pub fn kilometers(&self) -> f64 {
        self.value * self.unit.in_meters() / DistanceUnit::Kilometers.in_meters()
    }
}

const APPROX_EQUAL_KM: f64 = 1e-6;

impl PartialEq for Distance {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        (self.kilometers() - other.kilometers()).abs() < APPROX_EQUAL_KM
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.1}{}", self.value, self.unit.abbreviation())
    }
}
