use crate::config::PROXIMITY_THRESHOLD_M;
use crate::geo::{distance_m, eta_minutes, haversine_km};
use crate::structs::{BusStop, LatLng};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Proximity {
    /// No stop selected or the stop has no coordinates.
    Unknown,
    Far { distance_m: f64 },
    /// First observation within the threshold for the selected stop.
    Arrived { distance_m: f64 },
    /// Already alerted for the selected stop.
    Notified,
}

/// One-shot "bus approaching" detector, re-armed whenever the selected stop changes.
#[derive(Debug)]
pub struct ProximityNotifier {
    threshold_m: f64,
    stop_id: Option<String>,
    notified: bool,
}

impl Default for ProximityNotifier {
    fn default() -> Self {
        ProximityNotifier::new(PROXIMITY_THRESHOLD_M)
    }
}

impl ProximityNotifier {
    pub fn new(threshold_m: f64) -> Self {
        ProximityNotifier {
            threshold_m,
            stop_id: None,
            notified: false,
        }
    }

    #[cfg(test)]
    pub fn has_notified(&self) -> bool {
        self.notified
    }

    /// Tracks the selected stop identity; a different stop clears the notified flag.
    pub fn select_stop(&mut self, stop_id: Option<&str>) {
        if self.stop_id.as_deref() != stop_id {
            self.stop_id = stop_id.map(str::to_string);
            self.notified = false;
        }
    }

    pub fn observe(&mut self, bus: LatLng, stop: Option<&BusStop>) -> Proximity {
        self.select_stop(stop.map(|s| s.id.as_str()));
        if self.notified {
            return Proximity::Notified;
        }
        let Some(target) = stop.and_then(BusStop::coords) else {
            return Proximity::Unknown;
        };

        let distance_m = distance_m(bus, target);
        if distance_m <= self.threshold_m {
            self.notified = true;
            Proximity::Arrived { distance_m }
        } else {
            Proximity::Far { distance_m }
        }
    }
}

/// Sets every stop's ETA from the current bus location. Stops without coordinates get none.
pub fn recompute_etas(bus: LatLng, stops: &mut [BusStop]) {
    for stop in stops.iter_mut() {
        stop.eta = stop.coords().map(|at| eta_minutes(haversine_km(bus, at)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ~111 m per 0.001 degree of latitude
    fn stop(id: &str) -> BusStop {
        BusStop::new(id, id, 20.0, 78.0)
    }

    fn bus_at(offset_deg: f64) -> LatLng {
        LatLng::new(20.0 + offset_deg, 78.0)
    }

    #[test]
    fn fires_once_while_the_stop_stays_selected() {
        let mut notifier = ProximityNotifier::default();
        let s = stop("library");
        let samples = [0.02, 0.004, 0.002, 0.006, 0.001, 0.0];

        let fired = samples
            .iter()
            .map(|d| notifier.observe(bus_at(*d), Some(&s)))
            .filter(|p| matches!(p, Proximity::Arrived { .. }))
            .count();

        assert_eq!(fired, 1);
        assert!(notifier.has_notified());
    }

    #[test]
    fn never_fires_when_out_of_range() {
        let mut notifier = ProximityNotifier::default();
        let s = stop("library");
        for d in [0.05, 0.02, 0.0046] {
            assert!(matches!(
                notifier.observe(bus_at(d), Some(&s)),
                Proximity::Far { .. }
            ));
        }
        assert!(!notifier.has_notified());
    }

    #[test]
    fn reselection_rearms() {
        let mut notifier = ProximityNotifier::default();
        let a = stop("a");
        let b = stop("b");

        assert!(matches!(notifier.observe(bus_at(0.0), Some(&a)), Proximity::Arrived { .. }));
        assert_eq!(notifier.observe(bus_at(0.0), Some(&a)), Proximity::Notified);

        notifier.select_stop(Some("b"));
        assert!(!notifier.has_notified());
        assert!(matches!(notifier.observe(bus_at(0.0), Some(&b)), Proximity::Arrived { .. }));
    }

    #[test]
    fn no_stop_means_unknown() {
        let mut notifier = ProximityNotifier::default();
        assert_eq!(notifier.observe(bus_at(0.0), None), Proximity::Unknown);

        let mut broken = stop("broken");
        broken.location = None;
        assert_eq!(notifier.observe(bus_at(0.0), Some(&broken)), Proximity::Unknown);
    }

    #[test]
    fn etas_follow_the_bus() {
        let mut stops = vec![stop("near"), BusStop::new("far", "far", 20.0, 78.0)];
        stops[1].location = None;

        // 0.0225 degrees of latitude is ~2.5 km
        recompute_etas(bus_at(0.0225), &mut stops);
        assert_eq!(stops[0].eta, Some(5));
        assert_eq!(stops[1].eta, None);

        recompute_etas(bus_at(0.0), &mut stops);
        assert_eq!(stops[0].eta, Some(0));
    }
}
