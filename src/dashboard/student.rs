use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::map::{MapSync, MapWidget};
use crate::proximity::{recompute_etas, Proximity, ProximityNotifier};
use crate::store::{RealtimeStore, SnapshotResult};
use crate::structs::{Bus, BusStop, LatLng, RoutePoint};
use crate::subscriber::BusSubscriber;
use crate::toast::{Toast, Toaster};

pub enum StudentEvent {
    Snapshot(Option<SnapshotResult>),
    StopClicked(BusStop),
}

pub struct StudentDashboard<W: MapWidget> {
    subscriber: BusSubscriber,
    selected_stop: Option<BusStop>,
    notifier: ProximityNotifier,
    notifications_enabled: bool,
    route_points: Vec<RoutePoint>,
    map: Option<MapSync<W>>,
    stop_clicks_tx: mpsc::UnboundedSender<BusStop>,
    stop_clicks: mpsc::UnboundedReceiver<BusStop>,
    toaster: Arc<dyn Toaster>,
}

impl<W: MapWidget> StudentDashboard<W> {
    pub fn new<S: RealtimeStore>(store: &S, toaster: Arc<dyn Toaster>) -> Self {
        let (stop_clicks_tx, stop_clicks) = mpsc::unbounded_channel();
        StudentDashboard {
            subscriber: BusSubscriber::subscribe(store),
            selected_stop: None,
            notifier: ProximityNotifier::default(),
            notifications_enabled: false,
            route_points: vec![],
            map: None,
            stop_clicks_tx,
            stop_clicks,
            toaster,
        }
    }

    pub fn attach_map(&mut self, mut map: MapSync<W>) {
        map.on_stop_select(self.stop_clicks_tx.clone());
        map.sync_route(&self.route_points);
        self.map = Some(map);
        self.render();
    }

    pub fn map(&self) -> Option<&MapSync<W>> {
        self.map.as_ref()
    }

    pub fn buses(&self) -> &[Bus] {
        self.subscriber.buses()
    }

    pub fn selected_bus(&self) -> Option<&Bus> {
        self.subscriber.selected()
    }

    pub fn selected_stop(&self) -> Option<&BusStop> {
        self.selected_stop.as_ref()
    }

    /// Waits for the next snapshot or map click. Cancel safe.
    pub async fn next_event(&mut self) -> StudentEvent {
        if let Some(map) = &mut self.map {
            map.dispatch_events();
        }
        tokio::select! {
            item = self.subscriber.next_snapshot() => StudentEvent::Snapshot(item),
            Some(stop) = self.stop_clicks.recv() => StudentEvent::StopClicked(stop),
        }
    }

    /// Returns false once the bus subscription has ended.
    pub fn handle_event(&mut self, event: StudentEvent) -> bool {
        match event {
            StudentEvent::Snapshot(None) => return false,
            StudentEvent::Snapshot(Some(item)) => match self.subscriber.handle(item) {
                Ok(true) => self.refresh(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Bus subscription failed: {e}");
                    self.toaster
                        .toast(Toast::error("Error loading buses", e.to_string()));
                }
            },
            StudentEvent::StopClicked(stop) => {
                self.select_stop(&stop.id);
            }
        }
        true
    }

    pub fn select_bus(&mut self, bus_id: &str) -> bool {
        let previous = self.subscriber.selected().map(|b| b.id.clone());
        if self.subscriber.select(bus_id).is_none() {
            return false;
        }
        if previous.as_deref() != Some(bus_id) {
            if let Some(map) = &mut self.map {
                map.clear_bus();
            }
        }
        self.selected_stop = None;
        self.notifier.select_stop(None);
        self.refresh();
        true
    }

    pub fn select_stop(&mut self, stop_id: &str) -> bool {
        let Some(stop) = self
            .subscriber
            .selected()
            .and_then(|bus| bus.stops.iter().find(|s| s.id == stop_id))
            .cloned()
        else {
            return false;
        };

        self.notifier.select_stop(Some(&stop.id));
        if self.notifications_enabled {
            self.toaster.toast(Toast::info(
                "Stop Selected",
                format!("You'll be notified when the bus approaches {}.", stop.name),
            ));
        }
        self.selected_stop = Some(stop);
        self.refresh();
        true
    }

    pub fn toggle_notifications(&mut self) -> bool {
        self.notifications_enabled = !self.notifications_enabled;
        if let (true, Some(stop)) = (self.notifications_enabled, &self.selected_stop) {
            self.toaster.toast(Toast::info(
                "Notifications Enabled",
                format!("You'll be notified when the bus approaches {}.", stop.name),
            ));
        }
        self.notifications_enabled
    }

    /// Recomputes derived state for the selected bus and reconciles the map.
    fn refresh(&mut self) {
        if let Some(bus) = self.subscriber.selected_mut() {
            if let Some(location) = bus.location {
                recompute_etas(location.coords(), &mut bus.stops);
            }
        }

        let bus = self.subscriber.selected();
        if let (Some(bus), Some(selected)) = (bus, &mut self.selected_stop) {
            if let Some(fresh) = bus.stops.iter().find(|s| s.id == selected.id) {
                *selected = fresh.clone();
            }
        }

        let route: Vec<RoutePoint> = bus
            .map(|b| b.stops.iter().filter_map(BusStop::coords).collect())
            .unwrap_or_default();
        let route_changed = route != self.route_points;
        self.route_points = route;

        if let Some(map) = &mut self.map {
            if route_changed {
                map.sync_route(&self.route_points);
            }
        }
        self.render();
    }

    fn render(&mut self) {
        let bus = self.subscriber.selected();
        let location = bus.and_then(|b| b.location).map(|l| l.coords());
        let stops = bus.map(|b| b.stops.as_slice()).unwrap_or(&[]);

        let Some(map) = &mut self.map else {
            self.check_proximity(location);
            return;
        };
        map.sync_bus_location(location);
        map.sync_stops(stops, self.selected_stop.as_ref());
        self.check_proximity(location);
    }

    fn check_proximity(&mut self, location: Option<LatLng>) {
        let Some(at) = location else {
            return;
        };
        let Some(stop) = &self.selected_stop else {
            return;
        };
        if let Proximity::Arrived { distance_m } = self.notifier.observe(at, Some(stop)) {
            log::info!("Bus within {distance_m:.0}m of {}", stop.name);
            self.toaster.toast(
                Toast::info(
                    "Bus Approaching",
                    format!("The bus is now within 500 meters of {}!", stop.name),
                )
                .lasting(Duration::from_secs(10)),
            );
            if let Some(map) = &mut self.map {
                map.show_proximity(at);
            }
        }
    }

    /// Status lines for the selected bus.
    pub fn summary(&self) -> String {
        let Some(bus) = self.subscriber.selected() else {
            return "No bus selected".to_string();
        };
        let mut lines = vec![format!(
            "{} - {}",
            bus.label(),
            if bus.is_active() { "Active" } else { "Inactive" }
        )];
        if !bus.driver.is_empty() {
            lines.push(format!("Driver: {}", bus.driver));
        }
        if !bus.route.is_empty() {
            lines.push(format!("Route: {}", bus.route));
        }
        for stop in &bus.stops {
            match stop.eta {
                Some(eta) if eta > 0 => lines.push(format!("{} ({eta} min)", stop.name)),
                _ => lines.push(stop.name.clone()),
            }
        }
        if let Some(stop) = &self.selected_stop {
            let eta = stop
                .eta
                .filter(|m| *m > 0)
                .map_or("?".to_string(), |m| m.to_string());
            lines.push(format!("Your stop: {} - ETA {eta} minutes", stop.name));
            let alerts = if self.notifications_enabled { "on" } else { "off" };
            lines.push(format!("Notifications: {alerts}"));
        }
        lines.join("\n")
    }

    pub fn teardown(&mut self) {
        self.subscriber.unsubscribe();
        if let Some(mut map) = self.map.take() {
            map.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::init::default_options;
    use crate::map::scene::{SceneLibrary, SceneWidget, Viewport};
    use crate::map::{MapLibrary, MarkerIcon};
    use crate::store::memory::MemoryStore;
    use crate::toast::testing::RecordingToaster;
    use serde_json::json;

    fn dashboard(store: &MemoryStore, toaster: &RecordingToaster) -> StudentDashboard<SceneWidget> {
        let mut dashboard = StudentDashboard::new(store, Arc::new(toaster.clone()));
        let widget = SceneLibrary
            .create_map(&Viewport::new(800, 600), &default_options())
            .unwrap();
        dashboard.attach_map(MapSync::new(widget));
        dashboard
    }

    async fn pump(dashboard: &mut StudentDashboard<SceneWidget>) {
        let event = dashboard.next_event().await;
        assert!(dashboard.handle_event(event));
    }

    fn seed(store: &MemoryStore) {
        store.put(
            "buses",
            json!({
                "bus_a": {
                    "name": "North Loop", "number": "1", "status": "active",
                    "location": { "lat": 20.5937, "lng": 78.9404, "timestamp": 1 },
                    "stops": [
                        { "id": "a1", "name": "Library", "location": { "lat": 20.5937, "lng": 78.9629 } },
                        { "id": "a2", "name": "Gym", "location": { "lat": 20.6037, "lng": 78.9729 } }
                    ]
                },
                "bus_b": {
                    "name": "South Loop", "number": "2", "status": "inactive",
                    "stops": [
                        { "id": "b1", "name": "Dorms", "location": { "lat": 20.5, "lng": 78.9 } },
                        { "id": "b2", "name": "Labs", "location": { "lat": 20.51, "lng": 78.91 } },
                        { "id": "b3", "name": "Canteen", "location": { "lat": 20.52, "lng": 78.92 } }
                    ]
                }
            }),
        );
    }

    fn stop_popups(dashboard: &StudentDashboard<SceneWidget>) -> Vec<String> {
        dashboard
            .map()
            .unwrap()
            .widget()
            .markers()
            .filter(|(_, m)| matches!(m.spec.icon, MarkerIcon::Stop { .. }))
            .map(|(_, m)| m.spec.popup.clone().unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn active_bus_is_shown_with_etas() {
        let store = MemoryStore::default();
        let toaster = RecordingToaster::default();
        seed(&store);
        let mut dashboard = dashboard(&store, &toaster);
        pump(&mut dashboard).await;

        let bus = dashboard.selected_bus().unwrap();
        assert_eq!(bus.id, "bus_a");
        // 0.0225 degrees of longitude at this latitude is ~2.34 km
        assert_eq!(bus.stops[0].eta, Some(5));
        assert_eq!(stop_popups(&dashboard).len(), 2);
        assert_eq!(dashboard.map().unwrap().widget().polylines().count(), 1);
    }

    #[tokio::test]
    async fn switching_buses_rebuilds_every_stop_marker() {
        let store = MemoryStore::default();
        let toaster = RecordingToaster::default();
        seed(&store);
        let mut dashboard = dashboard(&store, &toaster);
        pump(&mut dashboard).await;
        assert!(dashboard.select_stop("a1"));

        assert!(dashboard.select_bus("bus_b"));
        assert!(dashboard.selected_stop().is_none());
        let popups = stop_popups(&dashboard);
        assert_eq!(
            popups,
            vec!["<b>Dorms</b>", "<b>Labs</b>", "<b>Canteen</b>"]
        );
        assert!(!dashboard.select_stop("a1"));
    }

    #[tokio::test]
    async fn approaching_bus_alerts_once_per_stop() {
        let store = MemoryStore::default();
        let toaster = RecordingToaster::default();
        seed(&store);
        let mut dashboard = dashboard(&store, &toaster);
        pump(&mut dashboard).await;
        dashboard.select_stop("a1");

        for lng in [78.9604, 78.9700, 78.9620] {
            store.put(
                "buses/bus_a/location",
                json!({ "lat": 20.5937, "lng": lng, "timestamp": 2 }),
            );
            pump(&mut dashboard).await;
        }
        assert_eq!(toaster.count("Bus Approaching"), 1);
        assert_eq!(dashboard.map().unwrap().widget().circles().count(), 1);

        dashboard.select_stop("a2");
        store.put(
            "buses/bus_a/location",
            json!({ "lat": 20.6030, "lng": 78.9729, "timestamp": 3 }),
        );
        pump(&mut dashboard).await;
        assert_eq!(toaster.count("Bus Approaching"), 2);
        assert_eq!(dashboard.map().unwrap().widget().circles().count(), 1);
    }

    #[tokio::test]
    async fn notification_toggle_confirms_the_stop() {
        let store = MemoryStore::default();
        let toaster = RecordingToaster::default();
        seed(&store);
        let mut dashboard = dashboard(&store, &toaster);
        pump(&mut dashboard).await;

        assert!(dashboard.toggle_notifications());
        assert!(toaster.all().is_empty());
        dashboard.select_stop("a2");
        assert_eq!(toaster.titles(), vec!["Stop Selected"]);
        assert!(!dashboard.toggle_notifications());
        assert!(dashboard.toggle_notifications());
        assert_eq!(toaster.titles(), vec!["Stop Selected", "Notifications Enabled"]);
    }

    #[tokio::test]
    async fn map_clicks_select_stops() {
        let store = MemoryStore::default();
        let toaster = RecordingToaster::default();
        seed(&store);
        let mut dashboard = dashboard(&store, &toaster);
        pump(&mut dashboard).await;

        let gym = dashboard
            .map()
            .unwrap()
            .widget()
            .markers()
            .find(|(_, m)| m.spec.popup.as_deref().map_or(false, |p| p.contains("Gym")))
            .map(|(id, _)| *id)
            .unwrap();
        dashboard.map.as_mut().unwrap().widget_mut().click(gym);

        pump(&mut dashboard).await;
        assert_eq!(dashboard.selected_stop().unwrap().id, "a2");
    }

    #[tokio::test]
    async fn summary_lists_etas() {
        let store = MemoryStore::default();
        let toaster = RecordingToaster::default();
        seed(&store);
        let mut dashboard = dashboard(&store, &toaster);
        assert_eq!(dashboard.summary(), "No bus selected");
        pump(&mut dashboard).await;
        dashboard.select_stop("a1");

        let summary = dashboard.summary();
        assert!(summary.starts_with("North Loop (1) - Active"));
        assert!(summary.contains("Library (5 min)"));
        assert!(summary.contains("Your stop: Library - ETA 5 minutes"));
        assert!(summary.ends_with("Notifications: off"));

        store.put("buses/bus_a/driver", json!("Ravi"));
        pump(&mut dashboard).await;
        let summary = dashboard.summary();
        assert!(summary.contains("Driver: Ravi"));
        assert!(!summary.contains("Route:"));
    }

    #[tokio::test]
    async fn teardown_releases_the_subscription() {
        let store = MemoryStore::default();
        let toaster = RecordingToaster::default();
        let mut dashboard = dashboard(&store, &toaster);
        assert_eq!(store.listener_count(), 1);

        dashboard.teardown();
        assert_eq!(store.listener_count(), 0);
        assert!(dashboard.map().is_none());
    }
}
