//! Geocoder implementation using the Nominatim search API.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use consolida_core::{Coordinates, GeocodePort, PortError};

/// Public OpenStreetMap instance.
pub const DEFAULT_BASE_URL: &str = "https://nominatim.openstreetmap.org";

/// Identifying user agent; the public instance rejects anonymous clients.
pub const USER_AGENT: &str = concat!("consolida/", env!("CARGO_PKG_VERSION"));

/// Single hit from /search?format=jsonv2
#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,

    #[serde(default)]
    display_name: String,
}

/// Address lookup against a Nominatim instance.
pub struct NominatimGeocoder {
    client: Client,
    base_url: String,
    country_codes: Option<String>,
}

impl NominatimGeocoder {
    /// Create a geocoder bound to the given HTTP client and the public instance.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_owned(),
            country_codes: None,
        }
    }

    /// Use another instance, e.g. a self-hosted one without the rate limit.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    /// Restrict hits to comma separated ISO 3166-1 country codes (`br`).
    #[must_use]
    pub fn with_country_codes(mut self, codes: impl Into<String>) -> Self {
        self.country_codes = Some(codes.into());
        self
    }
}

/// HTTP client carrying [`USER_AGENT`].
///
/// # Errors
///
/// Returns [`PortError::Network`] when the TLS backend cannot be initialised.
pub fn client() -> Result<Client, PortError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(PortError::from)
}

#[async_trait]
impl GeocodePort for NominatimGeocoder {
    fn name(&self) -> &str {
        "nominatim"
    }

    async fn locate(&self, query: &str) -> Result<Option<Coordinates>, PortError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(None);
        }

        let mut req = self.client.get(format!("{}/search", self.base_url)).query(&[
            ("q", query),
            ("format", "jsonv2"),
            ("limit", "1"),
        ]);
        if let Some(codes) = &self.country_codes {
            req = req.query(&[("countrycodes", codes.as_str())]);
        }

        let hits = fetch_json::<Vec<SearchHit>>(req).await?;
        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };
        tracing::debug!(query, matched = %hit.display_name, "nominatim hit");
        coordinates(&hit).map(Some)
    }
}

fn coordinates(hit: &SearchHit) -> Result<Coordinates, PortError> {
    let parse = |raw: &str| {
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| PortError::InvalidResponse(format!("Invalid coordinate `{raw}`")))
    };
    Ok(Coordinates {
        latitude: parse(&hit.lat)?,
        longitude: parse(&hit.lon)?,
    })
}

// Small helper to fetch and decode JSON with status handling.
async fn fetch_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, PortError> {
    req.send()
        .await
        .map_err(PortError::from)?
        .error_for_status()
        .map_err(PortError::from)?
        .json()
        .await
        .map_err(PortError::from)
}
