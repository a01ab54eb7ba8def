//! Directory Client (spec section 4.3): fetches the reference-station sourcetable and
//! ranks stations by distance to the rover. Grounded in
//! `examples/original_source/services/base_priorization_service.py`, with the HTTP GET
//! done through `hyper` (the teacher crate's HTTP client) instead of `requests`.

use std::time::Duration;

use hyper::{body::HttpBody, Client, Uri};
use log::warn;

use crate::error::RelayError;
use crate::geo::{haversine_km, Position};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A reference station as ranked against one rover position. `distance_km` is only
/// meaningful for the ranking pass that produced it (spec section 3).
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceStation {
    pub id: String,
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub distance_km: f64,
}

/// The two nearest stations to a rover position, nearest first.
#[derive(Debug, Clone, PartialEq)]
pub struct StationSelection {
    pub primary: ReferenceStation,
    pub helper: ReferenceStation,
}

impl StationSelection {
    /// A selection change is any change in either slot's id (spec section 3).
    pub fn differs_from(&self, other: &StationSelection) -> bool {
        self.primary.id != other.primary.id || self.helper.id != other.helper.id
    }
}

pub struct DirectoryClient {
    endpoint_url: String,
}

impl DirectoryClient {
    pub fn new(endpoint_url: String) -> Self {
        DirectoryClient { endpoint_url }
    }

    /// Fetch the sourcetable and rank its stations against `position`, returning the
    /// two closest. Fails with `RelayError::DirectoryUnavailable` on HTTP non-2xx,
    /// timeout, or a sourcetable with fewer than two parseable stations.
    pub async fn rank(&self, position: Position) -> Result<StationSelection, RelayError> {
        let body = self.fetch_sourcetable().await?;
        let mut stations = parse_sourcetable(&body);
        for station in &mut stations {
            station.distance_km = haversine_km(position, Position::new(station.lat_deg, station.lon_deg));
        }
        // Stable sort preserves sourcetable order among ties (spec section 4.1 tie-break rule).
        stations.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if stations.len() < 2 {
            return Err(RelayError::DirectoryUnavailable(
                "fewer than two stations with parseable coordinates".to_string(),
            ));
        }

        let mut it = stations.into_iter();
        let primary = it.next().unwrap();
        let helper = it.next().unwrap();
        Ok(StationSelection { primary, helper })
    }

    async fn fetch_sourcetable(&self) -> Result<String, RelayError> {
        let uri: Uri = self
            .endpoint_url
            .parse()
            .map_err(|e| RelayError::DirectoryUnavailable(format!("invalid directory URL: {e}")))?;

        let client = Client::new();
        let request = tokio::time::timeout(FETCH_TIMEOUT, client.get(uri))
            .await
            .map_err(|_| RelayError::DirectoryUnavailable("timed out".to_string()))?
            .map_err(|e| RelayError::DirectoryUnavailable(e.to_string()))?;

        if !request.status().is_success() {
            return Err(RelayError::DirectoryUnavailable(format!(
                "directory returned HTTP {}",
                request.status()
            )));
        }

        let mut response = request;
        let mut body = Vec::new();
        while let Some(chunk) = tokio::time::timeout(FETCH_TIMEOUT, response.data())
            .await
            .map_err(|_| RelayError::DirectoryUnavailable("timed out reading body".to_string()))?
        {
            let chunk = chunk.map_err(|e| RelayError::DirectoryUnavailable(e.to_string()))?;
            body.extend_from_slice(&chunk);
        }

        String::from_utf8(body)
            .map_err(|e| RelayError::DirectoryUnavailable(format!("non-UTF8 sourcetable: {e}")))
    }
}

/// Parse an NTRIP sourcetable document, per spec section 6: lines beginning `STR;`,
/// `;`-split, field 1 = mountpoint, fields 9/10 = lat/lon. Lines that don't parse are
/// skipped, matching `base_priorization_service.py`'s bare `try/except: continue`.
fn parse_sourcetable(body: &str) -> Vec<ReferenceStation> {
    let mut stations = Vec::new();
    for line in body.lines() {
        if !line.starts_with("STR;") {
            continue;
        }
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() <= 10 {
            warn!("skipping short sourcetable line");
            continue;
        }
        let (id, lat, lon) = (fields[1], fields[9], fields[10]);
        let (lat_deg, lon_deg) = match (lat.parse::<f64>(), lon.parse::<f64>()) {
            (Ok(lat_deg), Ok(lon_deg)) => (lat_deg, lon_deg),
            _ => {
                warn!("skipping sourcetable line with unparseable coordinates for {id}");
                continue;
            }
        };
        stations.push(ReferenceStation {
            id: id.to_string(),
            lat_deg,
            lon_deg,
            distance_km: 0.0,
        });
    }
    stations
}
