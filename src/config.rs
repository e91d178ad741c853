use std::time::Duration;

use thiserror::Error;

use crate::structs::LatLng;

//////////////////////////////////////////////////////////
// Constants
//////////////////////////////////////////////////////////
pub const EARTH_RADIUS_KM: f64 = 6371.0;
/// Distance at which the "bus approaching" alert fires.
pub const PROXIMITY_THRESHOLD_M: f64 = 500.0;
/// 30 km/h.
pub const AVERAGE_SPEED_KM_PER_MIN: f64 = 0.5;

pub const DEFAULT_CENTER: LatLng = LatLng { lat: 20.5937, lng: 78.9629 };
pub const DEFAULT_ZOOM: u8 = 5;
pub const MIN_ZOOM: u8 = 2;
pub const MAX_ZOOM: u8 = 18;
pub const BUS_ZOOM: u8 = 14;
pub const FIT_PADDING_PX: (u32, u32) = (50, 50);

/// Both container sides must exceed this before the map is constructed.
pub const MIN_CONTAINER_PX: u32 = 10;
pub const DIMENSION_RETRY_DELAY: Duration = Duration::from_millis(500);

pub const GEOLOCATION_TIMEOUT: Duration = Duration::from_millis(5000);
pub const ROUTE_HISTORY_LIMIT: usize = 1000;
pub const MAP_VIEWPORT: (u32, u32) = (800, 600);

pub const IDENTITY_TOOLKIT_URL: &str = "https://identitytoolkit.googleapis.com/v1";

//////////////////////////////////////////////////////////
// Runtime configuration
//////////////////////////////////////////////////////////
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub firebase_api_key: String,
    pub database_url: String,
    pub geolocation_timeout: Duration,
    pub route_history_limit: usize,
    pub viewport: (u32, u32),
}

impl Config {
    /// Reads the configuration from the process environment (after `.env` has been loaded).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let geolocation_timeout = match lookup("GEOLOCATION_TIMEOUT_MS") {
            Some(v) => Duration::from_millis(parse_number("GEOLOCATION_TIMEOUT_MS", &v)?),
            None => GEOLOCATION_TIMEOUT,
        };
        let route_history_limit = match lookup("ROUTE_HISTORY_LIMIT") {
            Some(v) => parse_number("ROUTE_HISTORY_LIMIT", &v)? as usize,
            None => ROUTE_HISTORY_LIMIT,
        };
        let viewport = match lookup("MAP_VIEWPORT") {
            Some(v) => parse_viewport(&v).ok_or(ConfigError::Invalid {
                name: "MAP_VIEWPORT",
                value: v,
            })?,
            None => MAP_VIEWPORT,
        };

        Ok(Config {
            firebase_api_key: required("FIREBASE_API_KEY")?,
            database_url: required("FIREBASE_DATABASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            geolocation_timeout,
            route_history_limit,
            viewport,
        })
    }
}

fn parse_number(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

/// Parses `WIDTHxHEIGHT`.
fn parse_viewport(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.trim().split_once(['x', 'X'])?;
    Some((w.parse().ok()?, h.parse().ok()?))
}
