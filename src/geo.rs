//! Great-circle helpers used for proximity checks and ETA estimates.

use crate::config::{AVERAGE_SPEED_KM_PER_MIN, EARTH_RADIUS_KM};
use crate::structs::LatLng;

/// Haversine distance in kilometres.
pub fn haversine_km(a: LatLng, b: LatLng) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

pub fn distance_m(a: LatLng, b: LatLng) -> f64 {
    haversine_km(a, b) * 1000.0
}

/// Straight-line estimate at a constant average speed, rounded to whole minutes.
pub fn eta_minutes(distance_km: f64) -> u32 {
    (distance_km.max(0.0) / AVERAGE_SPEED_KM_PER_MIN).round() as u32
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub south_west: LatLng,
    pub north_east: LatLng,
}

impl Bounds {
    /// Smallest box containing every point, `None` for an empty slice.
    pub fn from_points(points: &[LatLng]) -> Option<Bounds> {
        let (first, rest) = points.split_first()?;
        let mut bounds = Bounds {
            south_west: *first,
            north_east: *first,
        };
        for p in rest {
            bounds.south_west.lat = bounds.south_west.lat.min(p.lat);
            bounds.south_west.lng = bounds.south_west.lng.min(p.lng);
            bounds.north_east.lat = bounds.north_east.lat.max(p.lat);
            bounds.north_east.lng = bounds.north_east.lng.max(p.lng);
        }
        Some(bounds)
    }

    pub fn center(&self) -> LatLng {
        LatLng::new(
            (self.south_west.lat + self.north_east.lat) / 2.0,
            (self.south_west.lng + self.north_east.lng) / 2.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_distance() {
        // One degree of latitude is ~111.19 km on a 6371 km sphere
        let d = haversine_km(LatLng::new(0.0, 0.0), LatLng::new(1.0, 0.0));
        assert!((d - 111.195).abs() < 0.01);

        // NYC to LA is approximately 3,936 km
        let nyc = LatLng::new(40.7128, -74.0060);
        let la = LatLng::new(34.0522, -118.2437);
        assert!((haversine_km(nyc, la) - 3936.0).abs() < 50.0);
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let p = LatLng::new(20.5937, 78.9629);
        assert_eq!(distance_m(p, p), 0.0);
    }

    #[test]
    fn test_eta_rounds_to_minutes() {
        assert_eq!(eta_minutes(2.5), 5);
        assert_eq!(eta_minutes(0.0), 0);
        assert_eq!(eta_minutes(0.74), 1);
        assert_eq!(eta_minutes(1.2), 2);
    }

    #[test]
    fn test_bounds() {
        assert_eq!(Bounds::from_points(&[]), None);

        let b = Bounds::from_points(&[
            LatLng::new(1.0, 5.0),
            LatLng::new(-2.0, 7.0),
            LatLng::new(0.5, 6.0),
        ])
        .unwrap();
        assert_eq!(b.south_west, LatLng::new(-2.0, 5.0));
        assert_eq!(b.north_east, LatLng::new(1.0, 7.0));
        assert_eq!(b.center(), LatLng::new(-0.5, 6.0));
    }
}
