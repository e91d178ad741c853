use std::sync::Arc;

use tokio::sync::watch;

use crate::auth::{Authenticator, User};
use crate::geolocation::{PositionResult, PositionSource, WatchOptions};
use crate::map::{MapSync, MapWidget};
use crate::publisher::GeolocationPublisher;
use crate::store::{next_snapshot, RealtimeStore, SnapshotResult, Subscription};
use crate::structs::{default_stops, Bus, BusProfile, BusStatus, BusStop, DriverLink};
use crate::toast::{Toast, Toaster};

pub enum DriverEvent {
    AuthChanged(Option<User>),
    DriverLink(Option<SnapshotResult>),
    BusRecord(Option<SnapshotResult>),
    Position(PositionResult),
}

/// Signed-in driver state: profile, tracking and the route preview.
pub struct DriverDashboard<A, S, P, W>
where
    A: Authenticator,
    S: RealtimeStore,
    P: PositionSource + Clone,
    W: MapWidget,
{
    auth: A,
    store: S,
    source: P,
    toaster: Arc<dyn Toaster>,
    options: WatchOptions,
    route_limit: usize,
    auth_state: watch::Receiver<Option<User>>,
    user: Option<User>,
    /// Store handle carrying the signed-in user's token.
    session_store: Option<S>,
    publisher: Option<GeolocationPublisher<S, P>>,
    driver_link: Option<Subscription>,
    bus_record: Option<Subscription>,
    record: Option<Bus>,
    profile: BusProfile,
    map: Option<MapSync<W>>,
}

async fn next_position<S, P>(publisher: &mut Option<GeolocationPublisher<S, P>>) -> PositionResult
where
    S: RealtimeStore,
    P: PositionSource,
{
    match publisher {
        Some(publisher) => publisher.next_position().await,
        None => std::future::pending().await,
    }
}

impl<A, S, P, W> DriverDashboard<A, S, P, W>
where
    A: Authenticator,
    S: RealtimeStore,
    P: PositionSource + Clone,
    W: MapWidget,
{
    pub fn new(
        auth: A,
        store: S,
        source: P,
        toaster: Arc<dyn Toaster>,
        options: WatchOptions,
        route_limit: usize,
    ) -> Self {
        let auth_state = auth.auth_state();
        DriverDashboard {
            auth,
            store,
            source,
            toaster,
            options,
            route_limit,
            auth_state,
            user: None,
            session_store: None,
            publisher: None,
            driver_link: None,
            bus_record: None,
            record: None,
            profile: BusProfile::default(),
            map: None,
        }
    }

    pub fn attach_map(&mut self, map: MapSync<W>) {
        self.map = Some(map);
        self.render();
    }

    pub fn map(&self) -> Option<&MapSync<W>> {
        self.map.as_ref()
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn profile(&self) -> &BusProfile {
        &self.profile
    }

    pub fn is_tracking(&self) -> bool {
        self.publisher.as_ref().map_or(false, |p| p.is_tracking())
    }

    pub async fn login(&mut self, email: &str, password: &str) -> bool {
        if email.trim().is_empty() || password.is_empty() {
            self.toaster.toast(Toast::error(
                "Login failed",
                "Email and password are required",
            ));
            return false;
        }

        match self.auth.sign_in(email.trim(), password).await {
            Ok(user) => {
                log::info!("Driver {} signed in", user.uid);
                self.toaster.toast(Toast::info(
                    "Login successful",
                    "You are now logged in as a driver",
                ));
                self.sync_auth_state().await;
                true
            }
            Err(e) => {
                log::warn!("Sign in failed for {email}: {e}");
                self.toaster.toast(Toast::error("Login failed", e.to_string()));
                false
            }
        }
    }

    /// Stops tracking before signing out so the bus is left inactive.
    pub async fn logout(&mut self) {
        if let Some(publisher) = &mut self.publisher {
            publisher.stop_tracking().await;
        }
        match self.auth.sign_out().await {
            Ok(()) => self
                .toaster
                .toast(Toast::info("Logged out", "You have been logged out")),
            Err(e) => {
                log::error!("Sign out failed: {e}");
                self.toaster.toast(Toast::error("Logout failed", e.to_string()));
            }
        }
        self.sync_auth_state().await;
    }

    async fn sync_auth_state(&mut self) {
        let user = self.auth_state.borrow_and_update().clone();
        self.apply_auth_state(user).await;
    }

    async fn apply_auth_state(&mut self, user: Option<User>) {
        if self.user.as_ref().map(|u| &u.uid) == user.as_ref().map(|u| &u.uid) {
            return;
        }

        if let Some(mut publisher) = self.publisher.take() {
            publisher.stop_tracking().await;
        }
        self.driver_link = None;
        self.bus_record = None;
        self.record = None;
        self.profile = BusProfile::default();
        self.session_store = None;

        if let Some(user) = &user {
            let store = self.store.with_auth(&user.id_token);
            self.driver_link = Some(store.subscribe(&format!("drivers/{}", user.uid)));
            self.publisher = Some(GeolocationPublisher::new(
                store.clone(),
                self.source.clone(),
                self.toaster.clone(),
                &user.bus_id(),
                self.options,
                self.route_limit,
            ));
            self.session_store = Some(store);
        }
        self.user = user;
        self.render();
    }

    /// Waits for the next auth change, record snapshot or position sample. Cancel safe.
    pub async fn next_event(&mut self) -> DriverEvent {
        tokio::select! {
            Ok(()) = self.auth_state.changed() => {
                DriverEvent::AuthChanged(self.auth_state.borrow_and_update().clone())
            }
            item = next_snapshot(&mut self.driver_link) => DriverEvent::DriverLink(item),
            item = next_snapshot(&mut self.bus_record) => DriverEvent::BusRecord(item),
            result = next_position(&mut self.publisher) => DriverEvent::Position(result),
        }
    }

    pub async fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::AuthChanged(user) => self.apply_auth_state(user).await,
            DriverEvent::DriverLink(None) => self.driver_link = None,
            DriverEvent::DriverLink(Some(item)) => self.on_driver_link(item),
            DriverEvent::BusRecord(None) => self.bus_record = None,
            DriverEvent::BusRecord(Some(item)) => self.on_bus_record(item),
            DriverEvent::Position(result) => {
                if let Some(publisher) = &mut self.publisher {
                    publisher.handle_position(result).await;
                }
                self.render();
            }
        }
    }

    fn on_driver_link(&mut self, item: SnapshotResult) {
        let snapshot = match item {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("Driver record subscription failed: {e}");
                self.toaster
                    .toast(Toast::error("Error loading driver profile", e.to_string()));
                return;
            }
        };
        if !snapshot.exists() {
            return;
        }
        let link: DriverLink = match serde_json::from_value(snapshot.0) {
            Ok(link) => link,
            Err(e) => {
                log::warn!("Malformed driver record: {e}");
                return;
            }
        };
        if link.bus_id.is_empty() {
            return;
        }

        let path = format!("buses/{}", link.bus_id);
        if self.bus_record.as_ref().map(Subscription::path) == Some(path.as_str()) {
            return;
        }
        if let Some(store) = &self.session_store {
            self.bus_record = Some(store.subscribe(&path));
        }
    }

    fn on_bus_record(&mut self, item: SnapshotResult) {
        let snapshot = match item {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("Bus record subscription failed: {e}");
                return;
            }
        };
        if !snapshot.exists() {
            return;
        }
        match serde_json::from_value::<Bus>(snapshot.0) {
            Ok(bus) => {
                self.profile = BusProfile::from_bus(&bus);
                self.record = Some(bus);
                self.render();
            }
            Err(e) => log::warn!("Malformed bus record: {e}"),
        }
    }

    /// Validates and saves the bus record and the driver link. Stops are seeded
    /// only when the record has none yet.
    pub async fn submit_profile(&mut self, profile: BusProfile) -> bool {
        let (Some(user), Some(store)) = (&self.user, &self.session_store) else {
            self.toaster
                .toast(Toast::error("Not logged in", "Log in as a driver first"));
            return false;
        };
        if let Err(e) = profile.validate() {
            self.toaster.toast(Toast::error(
                "Error saving bus information",
                e.to_string(),
            ));
            return false;
        }

        let bus_id = user.bus_id();
        let existing = self.record.as_ref();
        let stops = existing
            .map(|bus| bus.stops.clone())
            .filter(|stops| !stops.is_empty())
            .unwrap_or_else(default_stops);
        let bus = Bus {
            id: bus_id.clone(),
            name: profile.name.clone(),
            number: profile.number.clone(),
            driver: profile.driver.clone(),
            route: profile.route.clone(),
            status: if self.is_tracking() {
                BusStatus::Active
            } else {
                BusStatus::Inactive
            },
            location: existing.and_then(|bus| bus.location),
            stops,
        };
        let link = DriverLink {
            bus_id: bus_id.clone(),
            name: profile.driver.clone(),
        };

        let saved = async {
            store
                .set(&format!("buses/{bus_id}"), serde_json::to_value(&bus)?)
                .await?;
            store
                .set(&format!("drivers/{}", user.uid), serde_json::to_value(&link)?)
                .await
        }
        .await;

        match saved {
            Ok(()) => {
                log::info!("Saved bus record {bus_id}");
                self.toaster.toast(Toast::info(
                    "Bus information saved",
                    "Your bus information has been updated",
                ));
                self.profile = profile;
                true
            }
            Err(e) => {
                log::error!("Saving bus record {bus_id} failed: {e}");
                self.toaster
                    .toast(Toast::error("Error saving bus information", e.to_string()));
                false
            }
        }
    }

    /// Returns whether tracking is on afterwards.
    pub async fn toggle_tracking(&mut self) -> bool {
        let Some(publisher) = &mut self.publisher else {
            self.toaster
                .toast(Toast::error("Not logged in", "Log in as a driver first"));
            return false;
        };
        if publisher.is_tracking() {
            publisher.stop_tracking().await;
        } else {
            publisher.start_tracking();
        }
        let tracking = publisher.is_tracking();
        self.render();
        tracking
    }

    pub fn status_text(&self) -> String {
        let Some(user) = &self.user else {
            return "Not logged in".to_string();
        };
        let mut lines = vec![format!(
            "Welcome, {}",
            user.email.as_deref().unwrap_or(&user.uid)
        )];
        if !self.profile.name.is_empty() {
            lines.push(format!(
                "Bus: {} ({}) on {}",
                self.profile.name, self.profile.number, self.profile.route
            ));
        }
        lines.push(format!(
            "Tracking: {}",
            if self.is_tracking() { "active" } else { "inactive" }
        ));
        match self.publisher.as_ref().and_then(|p| p.current_location()) {
            Some(at) => lines.push(format!("Location: {:.6}, {:.6}", at.lat, at.lng)),
            None => lines.push("Location: unknown".to_string()),
        }
        lines.join("\n")
    }

    fn stops(&self) -> Vec<BusStop> {
        self.record
            .as_ref()
            .map(|bus| bus.stops.clone())
            .filter(|stops| !stops.is_empty())
            .unwrap_or_else(default_stops)
    }

    fn render(&mut self) {
        let stops = self.stops();
        let (location, route) = match &self.publisher {
            Some(p) => (p.current_location(), p.route().to_vec()),
            None => (None, vec![]),
        };
        let Some(map) = &mut self.map else {
            return;
        };
        map.sync_bus_location(location);
        map.sync_stops(&stops, None);
        map.sync_route(&route);
    }

    pub async fn teardown(&mut self) {
        if let Some(mut publisher) = self.publisher.take() {
            publisher.stop_tracking().await;
        }
        self.driver_link = None;
        self.bus_record = None;
        if let Some(mut map) = self.map.take() {
            map.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::StaticAuth;
    use crate::geolocation::{LiveLocationFeed, Position};
    use crate::map::init::default_options;
    use crate::map::scene::{SceneLibrary, SceneWidget, Viewport};
    use crate::map::MapLibrary;
    use crate::store::memory::MemoryStore;
    use crate::structs::LatLng;
    use crate::toast::testing::RecordingToaster;
    use chrono::Utc;
    use serde_json::json;

    type Dashboard = DriverDashboard<StaticAuth, MemoryStore, LiveLocationFeed, SceneWidget>;

    fn dashboard(store: &MemoryStore, feed: &LiveLocationFeed, toaster: &RecordingToaster) -> Dashboard {
        let mut dashboard = DriverDashboard::new(
            StaticAuth::new("driver@campus.edu", "secret", "u1"),
            store.clone(),
            feed.clone(),
            Arc::new(toaster.clone()),
            WatchOptions::default(),
            100,
        );
        let widget = SceneLibrary
            .create_map(&Viewport::new(800, 600), &default_options())
            .unwrap();
        dashboard.attach_map(MapSync::new(widget));
        dashboard
    }

    fn profile() -> BusProfile {
        BusProfile {
            number: "7".into(),
            name: "East Loop".into(),
            driver: "Asha".into(),
            route: "Main gate - Hostels".into(),
        }
    }

    async fn pump(dashboard: &mut Dashboard) {
        let event = dashboard.next_event().await;
        dashboard.handle_event(event).await;
    }

    #[tokio::test]
    async fn login_requires_valid_credentials() {
        let store = MemoryStore::default();
        let feed = LiveLocationFeed::default();
        let toaster = RecordingToaster::default();
        let mut dashboard = dashboard(&store, &feed, &toaster);

        assert!(!dashboard.login("", "secret").await);
        assert!(!dashboard.login("driver@campus.edu", "wrong").await);
        assert!(dashboard.user().is_none());
        assert_eq!(toaster.count("Login failed"), 2);

        assert!(dashboard.login("driver@campus.edu", "secret").await);
        assert_eq!(dashboard.user().unwrap().uid, "u1");
        assert_eq!(toaster.count("Login successful"), 1);
        assert_eq!(dashboard.status_text().lines().next(), Some("Welcome, driver@campus.edu"));
    }

    #[tokio::test]
    async fn first_save_seeds_default_stops() {
        let store = MemoryStore::default();
        let feed = LiveLocationFeed::default();
        let toaster = RecordingToaster::default();
        let mut dashboard = dashboard(&store, &feed, &toaster);
        dashboard.login("driver@campus.edu", "secret").await;

        assert!(dashboard.submit_profile(profile()).await);
        let bus = store.get("buses/bus_u1");
        assert_eq!(bus["name"], "East Loop");
        assert_eq!(bus["status"], "inactive");
        assert_eq!(bus["stops"].as_array().unwrap().len(), 3);
        assert_eq!(bus["stops"][0]["id"], "stop1");
        assert_eq!(
            store.get("drivers/u1"),
            json!({ "busId": "bus_u1", "name": "Asha" })
        );
        assert_eq!(toaster.count("Bus information saved"), 1);
    }

    #[tokio::test]
    async fn existing_stops_are_kept_and_profile_prefilled() {
        let store = MemoryStore::default();
        store.put("drivers/u1", json!({ "busId": "bus_u1", "name": "Asha" }));
        store.put(
            "buses/bus_u1",
            json!({
                "name": "East Loop", "number": "7", "driver": "Asha", "route": "Ring",
                "status": "inactive",
                "stops": [{ "id": "gate", "name": "Gate", "location": { "lat": 1.0, "lng": 2.0 } }]
            }),
        );
        let feed = LiveLocationFeed::default();
        let toaster = RecordingToaster::default();
        let mut dashboard = dashboard(&store, &feed, &toaster);
        dashboard.login("driver@campus.edu", "secret").await;

        // drivers/u1 snapshot, then buses/bus_u1
        pump(&mut dashboard).await;
        pump(&mut dashboard).await;
        assert_eq!(dashboard.profile().route, "Ring");

        let mut edited = dashboard.profile().clone();
        edited.route = "Ring road".into();
        assert!(dashboard.submit_profile(edited).await);
        let stops = store.get("buses/bus_u1/stops");
        assert_eq!(stops.as_array().unwrap().len(), 1);
        assert_eq!(stops[0]["id"], "gate");
    }

    #[tokio::test]
    async fn incomplete_profile_is_rejected() {
        let store = MemoryStore::default();
        let feed = LiveLocationFeed::default();
        let toaster = RecordingToaster::default();
        let mut dashboard = dashboard(&store, &feed, &toaster);
        dashboard.login("driver@campus.edu", "secret").await;

        let mut missing = profile();
        missing.route = "  ".into();
        assert!(!dashboard.submit_profile(missing).await);
        assert!(store.get("buses/bus_u1").is_null());
        assert_eq!(toaster.count("Error saving bus information"), 1);
    }

    #[tokio::test]
    async fn tracking_publishes_samples_and_draws_route() {
        let store = MemoryStore::default();
        let feed = LiveLocationFeed::default();
        let toaster = RecordingToaster::default();
        let mut dashboard = dashboard(&store, &feed, &toaster);
        dashboard.login("driver@campus.edu", "secret").await;
        // drivers/u1 does not exist yet
        pump(&mut dashboard).await;

        assert!(dashboard.toggle_tracking().await);
        for lng in [78.96, 78.97] {
            feed.push(Position {
                coords: LatLng::new(20.59, lng),
                captured_at: Utc::now(),
            });
            pump(&mut dashboard).await;
        }

        assert_eq!(store.get("buses/bus_u1/status"), "active");
        assert_eq!(store.get("buses/bus_u1/location/lng"), 78.97);
        assert!(dashboard.status_text().contains("Location: 20.590000, 78.970000"));
        assert_eq!(dashboard.map().unwrap().widget().polylines().count(), 1);

        assert!(!dashboard.toggle_tracking().await);
        assert_eq!(store.get("buses/bus_u1/status"), "inactive");
    }

    #[tokio::test]
    async fn logout_stops_tracking_first() {
        let store = MemoryStore::default();
        let feed = LiveLocationFeed::default();
        let toaster = RecordingToaster::default();
        let mut dashboard = dashboard(&store, &feed, &toaster);
        dashboard.login("driver@campus.edu", "secret").await;
        dashboard.toggle_tracking().await;
        assert!(feed.is_watched());

        dashboard.logout().await;
        assert!(!feed.is_watched());
        assert!(dashboard.user().is_none());
        assert_eq!(store.get("buses/bus_u1/status"), "inactive");
        assert_eq!(dashboard.profile(), &BusProfile::default());
        assert_eq!(dashboard.status_text(), "Not logged in");
    }

    #[tokio::test]
    async fn tracking_requires_login() {
        let store = MemoryStore::default();
        let feed = LiveLocationFeed::default();
        let toaster = RecordingToaster::default();
        let mut dashboard = dashboard(&store, &feed, &toaster);

        assert!(!dashboard.toggle_tracking().await);
        assert_eq!(toaster.titles(), vec!["Not logged in"]);
        assert!(!feed.is_watched());
    }
}
