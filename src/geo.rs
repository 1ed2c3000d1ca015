use serde::{Deserialize, Serialize};
use std::fmt;

pub const EARTH_RADIUS: Kilometers = Kilometers(6371.0);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Kilometers(pub f64);

impl fmt::Display for Kilometers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} km", self.0)
    }
}

/// A point on the Earth, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance using the haversine formula.
    pub fn distance_to(&self, dest: &Coordinates) -> Kilometers {
        let dlat = (dest.latitude - self.latitude).to_radians();
        let dlon = (dest.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2)
            + self.latitude.to_radians().cos()
                * dest.latitude.to_radians().cos()
                * (dlon / 2.0).sin().powi(2);

        // Rounding can push `a` a hair past 1 for antipodal points.
        let a = a.clamp(0.0, 1.0);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        Kilometers(EARTH_RADIUS.0 * c)
    }
}
