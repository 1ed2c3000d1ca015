use crate::error::{ProbeError, Result};
use crate::geo::Coordinates;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use url::Url;

/// Byte count reported by one probe task or accumulated by a group.
pub type BytesTransferred = u64;

/// Identity of a benchmark server
pub type ServerId = u64;

/// Benchmark server definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,    // e.g. "Frankfurt"
    pub sponsor: String, // e.g. "Deutsche Telekom"
    pub country: String,
    pub cc: String,
    pub host: String,
    pub url: String, // e.g. "http://speed.example.net:8080/speedtest/upload.php"
    pub coordinates: Coordinates,
}

impl Server {
    pub fn new(id: ServerId, url: &str) -> Self {
        Self {
            id,
            name: String::new(),
            sponsor: String::new(),
            country: String::new(),
            cc: String::new(),
            host: String::new(),
            url: url.to_string(),
            coordinates: Coordinates::default(),
        }
    }

    /// Resolves `local` against the server's base URL, the way a browser
    /// resolves a relative link.
    pub fn relative_url(&self, local: &str) -> Result<String> {
        let base = Url::parse(&self.url).map_err(|source| ProbeError::Url {
            url: self.url.clone(),
            source,
        })?;
        let joined = base.join(local).map_err(|source| ProbeError::Url {
            url: local.to_string(),
            source,
        })?;
        Ok(joined.to_string())
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>8}: {} ({}, {}) {:?}",
            self.id, self.sponsor, self.name, self.country, self.url
        )
    }
}

/// Drops repeated ids (first occurrence wins) and orders by id, so that lists
/// merged from several mirrors rank reproducibly.
pub fn dedup_and_sort(servers: Vec<Server>) -> Vec<Server> {
    let mut seen = HashSet::new();
    let mut unique: Vec<Server> = servers.into_iter().filter(|s| seen.insert(s.id)).collect();
    unique.sort_by_key(|s| s.id);
    unique
}

const KILO: f64 = 1000.0;
const MEGA: f64 = 1000.0 * KILO;
const GIGA: f64 = 1000.0 * MEGA;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct BytesPerSecond(pub f64);

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct BitsPerSecond(pub f64);

impl BytesPerSecond {
    pub fn bits_per_second(self) -> BitsPerSecond {
        BitsPerSecond(self.0 * 8.0)
    }
}

impl BitsPerSecond {
    pub fn bytes_per_second(self) -> BytesPerSecond {
        BytesPerSecond(self.0 / 8.0)
    }
}

fn scaled(f: &mut fmt::Formatter<'_>, value: f64, unit: &str) -> fmt::Result {
    if value < KILO {
        write!(f, "{:.0} {}/s", value, unit)
    } else if value < MEGA {
        write!(f, "{:.2} K{}/s", value / KILO, unit)
    } else if value < GIGA {
        write!(f, "{:.2} M{}/s", value / MEGA, unit)
    } else {
        write!(f, "{:.2} G{}/s", value / GIGA, unit)
    }
}

impl fmt::Display for BytesPerSecond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        scaled(f, self.0, "B")
    }
}

impl fmt::Display for BitsPerSecond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        scaled(f, self.0, "b")
    }
}
