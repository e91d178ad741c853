use std::collections::HashMap;

use tokio::sync::mpsc;

use super::*;
use crate::config::{BUS_ZOOM, FIT_PADDING_PX, PROXIMITY_THRESHOLD_M};
use crate::structs::{BusStop, RoutePoint};

/// Sole owner of a map widget and of every handle created on it.
///
/// Stop markers and the route line are rebuilt wholesale on every change; the bus marker
/// and proximity circle are created once and then moved.
pub struct MapSync<W: MapWidget> {
    widget: W,
    live: bool,
    stops_layer: LayerGroupId,
    bus_marker: Option<MarkerId>,
    route_line: Option<PolylineId>,
    proximity_circle: Option<CircleId>,
    stop_markers: HashMap<MarkerId, BusStop>,
    on_stop_select: Option<mpsc::UnboundedSender<BusStop>>,
}

impl<W: MapWidget> MapSync<W> {
    pub fn new(mut widget: W) -> Self {
        let stops_layer = widget.add_layer_group();
        MapSync {
            widget,
            live: true,
            stops_layer,
            bus_marker: None,
            route_line: None,
            proximity_circle: None,
            stop_markers: HashMap::new(),
            on_stop_select: None,
        }
    }

    pub fn widget(&self) -> &W {
        &self.widget
    }

    #[cfg(test)]
    pub fn widget_mut(&mut self) -> &mut W {
        &mut self.widget
    }

    #[cfg(test)]
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Clicked stops are sent to `tx`.
    pub fn on_stop_select(&mut self, tx: mpsc::UnboundedSender<BusStop>) {
        self.on_stop_select = Some(tx);
    }

    pub fn sync_bus_location(&mut self, location: Option<LatLng>) {
        let Some(at) = location else {
            return;
        };
        if !self.live {
            return;
        }

        match self.bus_marker {
            Some(marker) => self.widget.move_marker(marker, at),
            None => {
                let marker = self.widget.add_marker(MarkerSpec {
                    position: at,
                    icon: MarkerIcon::Bus,
                    popup: Some("Bus Current Location".to_string()),
                    open_popup: false,
                    group: None,
                });
                log::debug!("Bus marker added at: {}, {}", at.lat, at.lng);
                self.bus_marker = Some(marker);
                self.widget.set_view(at, BUS_ZOOM);
            }
        }
    }

    /// Rebuilds the stop layer. Returns how many markers were drawn.
    pub fn sync_stops(&mut self, stops: &[BusStop], selected: Option<&BusStop>) -> usize {
        if !self.live {
            return 0;
        }
        self.widget.clear_layer_group(self.stops_layer);
        self.stop_markers.clear();

        if stops.is_empty() {
            log::debug!("No stops to display");
            return 0;
        }

        for stop in stops {
            let Some(at) = stop.coords() else {
                log::warn!("Invalid stop location for {}: {:?}", stop.name, stop.location);
                continue;
            };
            let is_selected = selected.map_or(false, |s| s.id == stop.id);

            let mut popup = format!("<b>{}</b>", stop.name);
            if let Some(eta) = stop.eta.filter(|m| *m > 0) {
                popup.push_str(&format!("<br>ETA: {eta} minutes"));
            }

            let marker = self.widget.add_marker(MarkerSpec {
                position: at,
                icon: MarkerIcon::Stop { selected: is_selected },
                popup: Some(popup),
                open_popup: is_selected,
                group: Some(self.stops_layer),
            });
            if self.on_stop_select.is_some() {
                self.widget.subscribe_click(marker);
            }
            self.stop_markers.insert(marker, stop.clone());
        }
        self.stop_markers.len()
    }

    /// Replaces the route line; fewer than two points draw nothing.
    pub fn sync_route(&mut self, points: &[RoutePoint]) {
        if !self.live {
            return;
        }
        if let Some(line) = self.route_line.take() {
            self.widget.remove_polyline(line);
        }
        if points.len() < 2 {
            return;
        }

        let line = self.widget.add_polyline(points, &PolylineStyle::default());
        self.route_line = Some(line);
        if let Some(bounds) = self.widget.polyline_bounds(line) {
            self.widget.fit_bounds(bounds, FIT_PADDING_PX);
        }
    }

    /// Highlights the area around the bus once a proximity alert fired.
    pub fn show_proximity(&mut self, center: LatLng) {
        if !self.live {
            return;
        }
        match self.proximity_circle {
            Some(circle) => self.widget.move_circle(circle, center),
            None => {
                let circle = self.widget.add_circle(
                    center,
                    &CircleStyle {
                        radius_m: PROXIMITY_THRESHOLD_M,
                        color: "rgba(34, 197, 94, 0.6)".to_string(),
                        fill_color: "rgba(34, 197, 94, 0.2)".to_string(),
                        fill_opacity: 0.5,
                        weight: 2,
                    },
                );
                self.proximity_circle = Some(circle);
            }
        }
    }

    /// Drops the bus marker and the proximity circle, e.g. when another bus is selected.
    /// The next location recenters the view.
    pub fn clear_bus(&mut self) {
        if !self.live {
            return;
        }
        if let Some(marker) = self.bus_marker.take() {
            self.widget.remove_marker(marker);
        }
        if let Some(circle) = self.proximity_circle.take() {
            self.widget.remove_circle(circle);
        }
    }

    /// Forwards pending widget clicks to the stop selection callback.
    pub fn dispatch_events(&mut self) {
        while let Some(event) = self.widget.poll_event() {
            let MapEvent::MarkerClicked(marker) = event;
            let (Some(stop), Some(tx)) = (self.stop_markers.get(&marker), &self.on_stop_select)
            else {
                continue;
            };
            let _ = tx.send(stop.clone());
        }
    }

    pub fn teardown(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        if let Some(marker) = self.bus_marker.take() {
            self.widget.remove_marker(marker);
        }
        self.widget.remove();
        self.route_line = None;
        self.proximity_circle = None;
        self.stop_markers.clear();
    }
}

impl<W: MapWidget> Drop for MapSync<W> {
    fn drop(&mut self) {
        self.teardown();
    }
}
