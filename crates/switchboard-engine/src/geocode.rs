//! Reverse geocoding for inbound location messages.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use switchboard_settings::GeocoderSettings;

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Request(String),

    #[error("geocoder returned {0}")]
    Status(u16),

    #[error("invalid geocoder response: {0}")]
    InvalidResponse(String),
}

/// Resolves coordinates to a structured address object.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` when the service knows nothing about the point.
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<Value>, GeocodeError>;
}

/// Location enrichment attached to a message's content as `locationInfo`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub formatted_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Raw address components from the geocoder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl LocationInfo {
    /// Build from a `locationMessage` payload and the geocoder's address.
    pub fn new(location: &Value, latitude: f64, longitude: f64, details: Option<Value>) -> Self {
        let formatted_address = details
            .as_ref()
            .map(format_address)
            .unwrap_or_else(|| UNKNOWN_LOCATION.to_string());
        let text = |key: &str| location.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            latitude,
            longitude,
            formatted_address,
            name: text("name"),
            address: text("address"),
            details,
        }
    }
}

const UNKNOWN_LOCATION: &str = "Unknown location";

/// Human-readable address: road, district, locality, state and country,
/// whichever are present, comma separated.
pub fn format_address(address: &Value) -> String {
    let first = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| address.get(*k).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
    };
    let parts: Vec<&str> = [
        first(&["road"]),
        first(&["suburb", "neighbourhood"]),
        first(&["city", "town", "village"]),
        first(&["state"]),
        first(&["country"]),
    ]
    .into_iter()
    .flatten()
    .collect();

    if parts.is_empty() {
        UNKNOWN_LOCATION.to_string()
    } else {
        parts.join(", ")
    }
}

/// Latitude and longitude of a `locationMessage`, when both are numeric.
pub fn coordinates(location: &Value) -> Option<(f64, f64)> {
    let lat = location.get("degreesLatitude")?.as_f64()?;
    let lon = location.get("degreesLongitude")?.as_f64()?;
    Some((lat, lon))
}

#[derive(Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<Value>,
}

/// Nominatim `/reverse` client.
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(
        base_url: impl Into<String>,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| GeocodeError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `None` when geocoding is disabled.
    pub fn from_settings(settings: &GeocoderSettings) -> Result<Option<Self>, GeocodeError> {
        if !settings.enabled {
            return Ok(None);
        }
        Self::new(
            settings.base_url.clone(),
            &settings.user_agent,
            Duration::from_millis(settings.timeout_ms),
        )
        .map(Some)
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Option<Value>, GeocodeError> {
        let url = format!("{}/reverse", self.base_url);
        debug!(latitude, longitude, "reverse geocoding");
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("format", "json".to_string()),
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("zoom", "18".to_string()),
                ("addressdetails", "1".to_string()),
            ])
            .send()
            .await
            .map_err(|e| GeocodeError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }
        let body: ReverseResponse = resp
            .json()
            .await
            .map_err(|e| GeocodeError::InvalidResponse(e.to_string()))?;
        Ok(body.address)
    }
}
