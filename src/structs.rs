use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        LatLng { lat, lng }
    }
}

/// One point of a rendered path.
pub type RoutePoint = LatLng;
/// Latest position reported by the driver's device.
pub type UserLocation = LatLng;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusStatus {
    Active,
    #[default]
    Inactive,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct BusLocation {
    pub lat: f64,
    pub lng: f64,
    /// Milliseconds since the unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

impl BusLocation {
    pub fn coords(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }
}

/// Stop coordinates as stored remotely. Kept untyped so one bad stop does not fail the
/// whole bus record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct StopLocation {
    #[serde(default)]
    pub lat: Value,
    #[serde(default)]
    pub lng: Value,
}

impl StopLocation {
    pub fn new(lat: f64, lng: f64) -> Self {
        StopLocation {
            lat: lat.into(),
            lng: lng.into(),
        }
    }

    /// `None` unless both coordinates are JSON numbers.
    pub fn coords(&self) -> Option<LatLng> {
        Some(LatLng::new(self.lat.as_f64()?, self.lng.as_f64()?))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BusStop {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: Option<StopLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_time: Option<String>,
    /// Minutes, derived from the bus location. Never written back.
    #[serde(skip)]
    pub eta: Option<u32>,
}

impl BusStop {
    pub fn new(id: &str, name: &str, lat: f64, lng: f64) -> Self {
        BusStop {
            id: id.to_string(),
            name: name.to_string(),
            location: Some(StopLocation::new(lat, lng)),
            ..Default::default()
        }
    }

    pub fn coords(&self) -> Option<LatLng> {
        self.location.as_ref().and_then(StopLocation::coords)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct Bus {
    /// Injected from the record key.
    #[serde(default, skip_serializing)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub status: BusStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<BusLocation>,
    #[serde(default)]
    pub stops: Vec<BusStop>,
}

impl Bus {
    pub fn is_active(&self) -> bool {
        self.status == BusStatus::Active
    }

    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.number)
    }
}

/// `drivers/{uid}` record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DriverLink {
    #[serde(default)]
    pub bus_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("{0} is required")]
    MissingField(&'static str),
}

/// Driver-editable fields of a bus record.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct BusProfile {
    pub number: String,
    pub name: String,
    pub driver: String,
    pub route: String,
}

impl BusProfile {
    pub fn from_bus(bus: &Bus) -> Self {
        BusProfile {
            number: bus.number.clone(),
            name: bus.name.clone(),
            driver: bus.driver.clone(),
            route: bus.route.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        let fields = [
            ("bus number", &self.number),
            ("bus name", &self.name),
            ("driver name", &self.driver),
            ("route name", &self.route),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ProfileError::MissingField(name));
            }
        }
        Ok(())
    }
}

/// Stop layout seeded into a freshly created bus record.
pub fn default_stops() -> Vec<BusStop> {
    vec![
        BusStop::new("stop1", "Stop 1", 20.5937, 78.9629),
        BusStop::new("stop2", "Stop 2", 20.6037, 78.9729),
        BusStop::new("stop3", "Stop 3", 20.6137, 78.9829),
    ]
}

/// Decodes the `buses` collection (object of objects) into records carrying their key as id.
/// Records that do not decode are skipped.
pub fn decode_buses(value: &Value) -> Vec<Bus> {
    let Some(records) = value.as_object() else {
        return vec![];
    };

    records
        .iter()
        .filter_map(|(key, record)| match serde_json::from_value::<Bus>(record.clone()) {
            Ok(mut bus) => {
                bus.id = key.clone();
                Some(bus)
            }
            Err(e) => {
                log::warn!("Skipping bus record {key}: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn buses_get_their_key_as_id() {
        let buses = decode_buses(&json!({
            "bus_a": { "name": "Campus Loop", "number": "7", "status": "active",
                       "location": { "lat": 1.0, "lng": 2.0, "timestamp": 5 },
                       "stops": [{ "id": "s1", "name": "Library", "location": { "lat": 1.0, "lng": 2.0 } }] },
            "bus_b": { "name": "Night Line" }
        }));

        assert_eq!(buses.len(), 2);
        assert_eq!(buses[0].id, "bus_a");
        assert!(buses[0].is_active());
        assert_eq!(buses[0].location.unwrap().coords(), LatLng::new(1.0, 2.0));
        assert_eq!(buses[0].stops[0].coords(), Some(LatLng::new(1.0, 2.0)));
        assert_eq!(buses[1].id, "bus_b");
        assert_eq!(buses[1].status, BusStatus::Inactive);
        assert!(buses[1].location.is_none());
    }

    #[test]
    fn malformed_stop_coordinates_still_decode() {
        let buses = decode_buses(&json!({
            "bus_a": { "stops": [
                { "id": "s1", "name": "Gym", "location": { "lat": "north", "lng": 2.0 } },
                { "id": "s2", "name": "Dorms" }
            ] }
        }));

        assert_eq!(buses[0].stops.len(), 2);
        assert_eq!(buses[0].stops[0].coords(), None);
        assert_eq!(buses[0].stops[1].coords(), None);
    }

    #[test]
    fn broken_records_are_skipped() {
        let buses = decode_buses(&json!({ "bus_a": { "status": "parked" }, "bus_b": {} }));
        assert_eq!(buses.len(), 1);
        assert_eq!(buses[0].id, "bus_b");
    }

    #[test]
    fn serialized_bus_omits_id_and_eta() {
        let mut bus = Bus {
            id: "bus_x".into(),
            name: "Loop".into(),
            stops: default_stops(),
            ..Default::default()
        };
        bus.stops[0].eta = Some(3);

        let value = serde_json::to_value(&bus).unwrap();
        assert!(value.get("id").is_none());
        assert!(value["stops"][0].get("eta").is_none());
        assert_eq!(value["status"], "inactive");
        assert_eq!(value["stops"][2]["location"]["lat"], 20.6137);
    }

    #[test]
    fn profile_requires_every_field() {
        let mut profile = BusProfile {
            number: "12".into(),
            name: "Loop".into(),
            driver: "Sam".into(),
            route: " ".into(),
        };
        assert_eq!(profile.validate(), Err(ProfileError::MissingField("route name")));
        profile.route = "North".into();
        assert_eq!(profile.validate(), Ok(()));
    }
}
