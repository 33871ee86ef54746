use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::models::GeoPoint;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Best-effort location for an IP. `resolve` never fails: any lookup problem
/// collapses into `fallback_location()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub lat: f64,
    pub lng: f64,
    pub city: String,
}

impl ResolvedLocation {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lng, self.lat)
    }
}

pub fn fallback_location() -> ResolvedLocation {
    ResolvedLocation {
        lat: 28.6139,
        lng: 77.2090,
        city: "Unknown".to_string(),
    }
}

#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Raw lookup; None on any failure. Retrieval paths use this so a failed
    /// candidate can be skipped instead of being pinned to the fallback city.
    async fn try_resolve(&self, ip: &str) -> Option<ResolvedLocation>;

    /// Infallible form for request-level lookups: any failure resolves to the
    /// fixed fallback location.
    async fn resolve(&self, ip: &str) -> ResolvedLocation {
        match self.try_resolve(ip).await {
            Some(loc) => loc,
            None => {
                warn!("[GEO] Lookup failed for {}, using fallback coordinates", ip);
                fallback_location()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpWhoisResponse {
    success: Option<bool>,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// ipwho.is lookup client. The service does not rate limit localhost.
pub struct IpWhoisResolver {
    http: reqwest::Client,
}

impl IpWhoisResolver {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn lookup(&self, ip: &str) -> Option<ResolvedLocation> {
        let url = format!("https://ipwho.is/{}", ip);
        let resp = self.http.get(&url).send().await.ok()?;
        let body: IpWhoisResponse = resp.json().await.ok()?;
        if body.success == Some(false) {
            return None;
        }
        Some(ResolvedLocation {
            lat: body.latitude?,
            lng: body.longitude?,
            city: body.city.unwrap_or_else(|| "Unknown".to_string()),
        })
    }
}

impl Default for IpWhoisResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoResolver for IpWhoisResolver {
    async fn try_resolve(&self, ip: &str) -> Option<ResolvedLocation> {
        self.lookup(ip).await
    }
}

/// Great-circle distance in meters between two (lng, lat) points.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lng - a.lng).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_for_same_point() {
        let p = GeoPoint::new(77.2090, 28.6139);
        assert_eq!(haversine_m(p, p), 0.0);
    }

    #[test]
    fn haversine_short_hop_is_under_search_radius() {
        // ~1.5 km apart, well inside the 10 km default radius.
        let a = GeoPoint::new(77.20, 28.60);
        let b = GeoPoint::new(77.21, 28.61);
        let d = haversine_m(a, b);
        assert!(d > 1_000.0 && d < 2_000.0, "got {}", d);
    }

    #[test]
    fn haversine_known_city_pair() {
        // Delhi to Mumbai is roughly 1,150 km.
        let delhi = GeoPoint::new(77.2090, 28.6139);
        let mumbai = GeoPoint::new(72.8777, 19.0760);
        let d = haversine_m(delhi, mumbai);
        assert!((1_100_000.0..1_200_000.0).contains(&d), "got {}", d);
    }

    #[test]
    fn fallback_is_fixed() {
        let loc = fallback_location();
        assert_eq!(loc.city, "Unknown");
        assert!(loc.point().is_known());
    }
}
