use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::geolocation::*;
use crate::store::RealtimeStore;
use crate::structs::{BusStatus, RoutePoint, UserLocation};
use crate::toast::{Toast, Toaster};

/// Route history kept for the current session. Oldest points are evicted first.
#[derive(Clone, Debug)]
pub struct RouteHistory {
    points: VecDeque<RoutePoint>,
    limit: usize,
}

impl RouteHistory {
    pub fn new(limit: usize) -> Self {
        RouteHistory {
            points: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, point: RoutePoint) {
        if self.points.len() == self.limit {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn to_vec(&self) -> Vec<RoutePoint> {
        self.points.iter().copied().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.points.len()
    }
}

/// Publishes the driver's device position to `buses/{bus_id}`.
pub struct GeolocationPublisher<S: RealtimeStore, P: PositionSource> {
    store: S,
    source: P,
    toaster: Arc<dyn Toaster>,
    bus_id: String,
    options: WatchOptions,
    watch: Option<PositionWatch>,
    current: Option<UserLocation>,
    route: RouteHistory,
}

impl<S: RealtimeStore, P: PositionSource> GeolocationPublisher<S, P> {
    pub fn new(
        store: S,
        source: P,
        toaster: Arc<dyn Toaster>,
        bus_id: &str,
        options: WatchOptions,
        route_limit: usize,
    ) -> Self {
        GeolocationPublisher {
            store,
            source,
            toaster,
            bus_id: bus_id.to_string(),
            options,
            watch: None,
            current: None,
            route: RouteHistory::new(route_limit),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.watch.is_some()
    }

    pub fn current_location(&self) -> Option<UserLocation> {
        self.current
    }

    pub fn route(&self) -> &RouteHistory {
        &self.route
    }

    /// Starts watching the device position. No-op while already tracking.
    pub fn start_tracking(&mut self) {
        if self.watch.is_some() {
            return;
        }
        match self.source.watch_position(self.options) {
            Ok(watch) => {
                self.watch = Some(watch);
                log::info!("Tracking started for {}", self.bus_id);
                self.toaster.toast(Toast::info(
                    "Location tracking started",
                    "Your bus location is now being shared",
                ));
            }
            Err(e) => {
                log::error!("Cannot watch position for {}: {e}", self.bus_id);
                self.toaster
                    .toast(Toast::error("Geolocation not supported", e.to_string()));
            }
        }
    }

    /// Clears the watch and marks the bus inactive. No-op while not tracking.
    pub async fn stop_tracking(&mut self) {
        let Some(watch) = self.watch.take() else {
            return;
        };
        watch.clear();
        log::info!("Tracking stopped for {}", self.bus_id);

        self.write_status(BusStatus::Inactive).await;
        self.toaster.toast(Toast::info(
            "Location tracking stopped",
            "You are no longer sharing your location",
        ));
    }

    /// Waits for the next position of the active watch. Pends while not tracking.
    /// Cancel safe; hand the result to [`Self::handle_position`].
    pub async fn next_position(&mut self) -> PositionResult {
        match &mut self.watch {
            Some(watch) => watch.next().await,
            None => std::future::pending().await,
        }
    }

    pub async fn handle_position(&mut self, result: PositionResult) {
        match result {
            Ok(position) => self.publish(position).await,
            Err(e) => {
                log::error!("Error getting location for {}: {e}", self.bus_id);
                self.toaster.toast(Toast::error(
                    "Location error",
                    format!("Error getting location: {e}"),
                ));
                self.stop_tracking().await;
            }
        }
    }

    async fn publish(&mut self, position: Position) {
        let coords = position.coords;
        self.current = Some(coords);
        log::debug!("{} at {:.6}, {:.6}", self.bus_id, coords.lat, coords.lng);

        let location = json!({
            "lat": coords.lat,
            "lng": coords.lng,
            "timestamp": Utc::now().timestamp_millis(),
        });
        if let Err(e) = self
            .store
            .set(&format!("buses/{}/location", self.bus_id), location)
            .await
        {
            log::error!("Saving location of {} failed: {e}", self.bus_id);
            self.toaster
                .toast(Toast::error("Error saving location", e.to_string()));
        }
        self.write_status(BusStatus::Active).await;

        self.route.push(coords);
    }

    async fn write_status(&mut self, status: BusStatus) {
        let value = match serde_json::to_value(status) {
            Ok(v) => v,
            Err(e) => {
                log::error!("Encoding status failed: {e}");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set(&format!("buses/{}/status", self.bus_id), value)
            .await
        {
            log::error!("Updating status of {} failed: {e}", self.bus_id);
            self.toaster
                .toast(Toast::error("Error updating status", e.to_string()));
        }
    }
}
