//! Map widget boundary and the layer that keeps it in sync with bus data.
//!
//! The widget is an imperative, stateful object owned exclusively by [`MapSync`]. Widgets
//! are produced by a [`MapLibrary`] handle, which itself comes from a [`MapLoader`]; the
//! handle is passed around explicitly rather than living in a global.

pub mod init;
pub mod scene;
pub mod sync;

use std::future::Future;

use thiserror::Error;

use crate::geo::Bounds;
use crate::structs::LatLng;

pub use init::mount;
pub use sync::MapSync;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("failed to load map library: {0}")]
    Load(String),
    #[error("failed to initialize map: {0}")]
    Init(String),
}

macro_rules! handle_id {
    ($($name:ident),*) => {
        $(
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

handle_id!(MarkerId, PolylineId, CircleId, LayerGroupId);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerIcon {
    Bus,
    /// Selected stops are drawn larger, filled, with a checkmark.
    Stop { selected: bool },
}

#[derive(Clone, Debug, PartialEq)]
pub struct MarkerSpec {
    pub position: LatLng,
    pub icon: MarkerIcon,
    pub popup: Option<String>,
    pub open_popup: bool,
    pub group: Option<LayerGroupId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolylineStyle {
    pub color: String,
    pub weight: u32,
    pub opacity: f64,
}

impl Default for PolylineStyle {
    fn default() -> Self {
        PolylineStyle {
            color: "#2563eb".to_string(),
            weight: 4,
            opacity: 0.7,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CircleStyle {
    pub radius_m: f64,
    pub color: String,
    pub fill_color: String,
    pub fill_opacity: f64,
    pub weight: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapOptions {
    pub center: LatLng,
    pub zoom: u8,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapEvent {
    MarkerClicked(MarkerId),
}

/// Imperative surface of an interactive map. All calls are synchronous.
pub trait MapWidget: Send {
    fn set_view(&mut self, center: LatLng, zoom: u8);

    fn add_marker(&mut self, spec: MarkerSpec) -> MarkerId;
    fn move_marker(&mut self, marker: MarkerId, to: LatLng);
    fn remove_marker(&mut self, marker: MarkerId);
    /// Reports clicks on `marker` through [`MapWidget::poll_event`].
    fn subscribe_click(&mut self, marker: MarkerId);

    fn add_layer_group(&mut self) -> LayerGroupId;
    fn clear_layer_group(&mut self, group: LayerGroupId);

    fn add_polyline(&mut self, points: &[LatLng], style: &PolylineStyle) -> PolylineId;
    fn remove_polyline(&mut self, line: PolylineId);
    fn polyline_bounds(&self, line: PolylineId) -> Option<Bounds>;
    fn fit_bounds(&mut self, bounds: Bounds, padding: (u32, u32));

    fn add_circle(&mut self, center: LatLng, style: &CircleStyle) -> CircleId;
    fn move_circle(&mut self, circle: CircleId, center: LatLng);
    fn remove_circle(&mut self, circle: CircleId);

    fn poll_event(&mut self) -> Option<MapEvent>;

    /// Tears the widget down. Further calls are ignored.
    fn remove(&mut self);
}

/// Element the map renders into.
pub trait MapContainer: Sync {
    /// Rendered (width, height) in pixels.
    fn client_size(&self) -> (u32, u32);
}

/// Loaded map library.
pub trait MapLibrary: Send + Sync {
    type Widget: MapWidget;

    fn create_map(
        &self,
        container: &dyn MapContainer,
        options: &MapOptions,
    ) -> Result<Self::Widget, MapError>;
}

pub trait MapLoader: Send + Sync {
    type Library: MapLibrary;

    fn load(&self) -> impl Future<Output = Result<Self::Library, MapError>> + Send;
}
