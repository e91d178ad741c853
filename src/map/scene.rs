//! Headless map widget. Keeps its layers in memory and exports them as GeoJSON.

use std::collections::{BTreeMap, VecDeque};

use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue};

use super::*;

/// Fixed-size render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Viewport { width, height }
    }
}

impl MapContainer for Viewport {
    fn client_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

pub struct SceneLoader;

impl MapLoader for SceneLoader {
    type Library = SceneLibrary;

    async fn load(&self) -> Result<SceneLibrary, MapError> {
        Ok(SceneLibrary)
    }
}

pub struct SceneLibrary;

impl MapLibrary for SceneLibrary {
    type Widget = SceneWidget;

    fn create_map(
        &self,
        container: &dyn MapContainer,
        options: &MapOptions,
    ) -> Result<SceneWidget, MapError> {
        if options.min_zoom > options.max_zoom {
            return Err(MapError::Init(format!(
                "zoom range {}..{} is empty",
                options.min_zoom, options.max_zoom
            )));
        }
        Ok(SceneWidget::new(container.client_size(), options))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SceneMarker {
    pub spec: MarkerSpec,
    pub clickable: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScenePolyline {
    pub points: Vec<LatLng>,
    pub style: PolylineStyle,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SceneCircle {
    pub center: LatLng,
    pub style: CircleStyle,
}

pub struct SceneWidget {
    size: (u32, u32),
    center: LatLng,
    zoom: u8,
    min_zoom: u8,
    max_zoom: u8,
    fitted: Option<(Bounds, (u32, u32))>,
    next_id: u64,
    groups: Vec<LayerGroupId>,
    markers: BTreeMap<MarkerId, SceneMarker>,
    polylines: BTreeMap<PolylineId, ScenePolyline>,
    circles: BTreeMap<CircleId, SceneCircle>,
    events: VecDeque<MapEvent>,
    removed: bool,
}

impl SceneWidget {
    fn new(size: (u32, u32), options: &MapOptions) -> Self {
        SceneWidget {
            size,
            center: options.center,
            zoom: options.zoom,
            min_zoom: options.min_zoom,
            max_zoom: options.max_zoom,
            fitted: None,
            next_id: 0,
            groups: vec![],
            markers: BTreeMap::new(),
            polylines: BTreeMap::new(),
            circles: BTreeMap::new(),
            events: VecDeque::new(),
            removed: false,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn view(&self) -> (LatLng, u8) {
        (self.center, self.zoom)
    }

    pub fn fitted(&self) -> Option<(Bounds, (u32, u32))> {
        self.fitted
    }

    pub fn markers(&self) -> impl Iterator<Item = (&MarkerId, &SceneMarker)> {
        self.markers.iter()
    }

    pub fn polylines(&self) -> impl Iterator<Item = &ScenePolyline> {
        self.polylines.values()
    }

    pub fn circles(&self) -> impl Iterator<Item = &SceneCircle> {
        self.circles.values()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Simulates a user click on a marker.
    #[cfg(test)]
    pub fn click(&mut self, marker: MarkerId) {
        if self.markers.get(&marker).map_or(false, |m| m.clickable) {
            self.events.push_back(MapEvent::MarkerClicked(marker));
        }
    }

    /// Current layers as a feature collection; the view is kept in foreign members.
    pub fn to_geojson(&self) -> FeatureCollection {
        let mut features = vec![];

        for marker in self.markers.values() {
            let mut props = JsonObject::new();
            let kind = match marker.spec.icon {
                MarkerIcon::Bus => "bus",
                MarkerIcon::Stop { .. } => "stop",
            };
            props.insert("kind".into(), kind.into());
            if let MarkerIcon::Stop { selected } = marker.spec.icon {
                props.insert("selected".into(), selected.into());
            }
            if let Some(popup) = &marker.spec.popup {
                props.insert("popup".into(), popup.clone().into());
            }
            features.push(feature(point(marker.spec.position), props));
        }

        for line in self.polylines.values() {
            let mut props = JsonObject::new();
            props.insert("kind".into(), "route".into());
            props.insert("stroke".into(), line.style.color.clone().into());
            props.insert("stroke-width".into(), line.style.weight.into());
            props.insert("stroke-opacity".into(), line.style.opacity.into());
            let coords = line.points.iter().map(|p| vec![p.lng, p.lat]).collect();
            features.push(feature(geojson::Value::LineString(coords), props));
        }

        for circle in self.circles.values() {
            let mut props = JsonObject::new();
            props.insert("kind".into(), "proximity".into());
            props.insert("radius".into(), circle.style.radius_m.into());
            props.insert("stroke".into(), circle.style.color.clone().into());
            props.insert("fill".into(), circle.style.fill_color.clone().into());
            props.insert("fill-opacity".into(), circle.style.fill_opacity.into());
            features.push(feature(point(circle.center), props));
        }

        let mut view = JsonObject::new();
        view.insert("center".into(), vec![self.center.lng, self.center.lat].into());
        view.insert("zoom".into(), self.zoom.into());
        view.insert("width".into(), self.size.0.into());
        view.insert("height".into(), self.size.1.into());
        if let Some((bounds, padding)) = self.fitted {
            let bbox = vec![
                bounds.south_west.lng,
                bounds.south_west.lat,
                bounds.north_east.lng,
                bounds.north_east.lat,
            ];
            view.insert("bounds".into(), bbox.into());
            view.insert("padding".into(), vec![padding.0, padding.1].into());
        }
        let mut foreign = JsonObject::new();
        foreign.insert("view".into(), JsonValue::Object(view));

        FeatureCollection {
            bbox: None,
            features,
            foreign_members: Some(foreign),
        }
    }
}

fn point(at: LatLng) -> geojson::Value {
    geojson::Value::Point(vec![at.lng, at.lat])
}

fn feature(value: geojson::Value, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(value)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

impl MapWidget for SceneWidget {
    fn set_view(&mut self, center: LatLng, zoom: u8) {
        if self.removed {
            return;
        }
        self.center = center;
        self.zoom = zoom.clamp(self.min_zoom, self.max_zoom);
    }

    fn add_marker(&mut self, spec: MarkerSpec) -> MarkerId {
        let id = MarkerId(self.next_id());
        if !self.removed {
            self.markers.insert(id, SceneMarker { spec, clickable: false });
        }
        id
    }

    fn move_marker(&mut self, marker: MarkerId, to: LatLng) {
        if let Some(m) = self.markers.get_mut(&marker) {
            m.spec.position = to;
        }
    }

    fn remove_marker(&mut self, marker: MarkerId) {
        self.markers.remove(&marker);
    }

    fn subscribe_click(&mut self, marker: MarkerId) {
        if let Some(m) = self.markers.get_mut(&marker) {
            m.clickable = true;
        }
    }

    fn add_layer_group(&mut self) -> LayerGroupId {
        let id = LayerGroupId(self.next_id());
        self.groups.push(id);
        id
    }

    fn clear_layer_group(&mut self, group: LayerGroupId) {
        self.markers.retain(|_, m| m.spec.group != Some(group));
    }

    fn add_polyline(&mut self, points: &[LatLng], style: &PolylineStyle) -> PolylineId {
        let id = PolylineId(self.next_id());
        if !self.removed {
            self.polylines.insert(
                id,
                ScenePolyline {
                    points: points.to_vec(),
                    style: style.clone(),
                },
            );
        }
        id
    }

    fn remove_polyline(&mut self, line: PolylineId) {
        self.polylines.remove(&line);
    }

    fn polyline_bounds(&self, line: PolylineId) -> Option<Bounds> {
        Bounds::from_points(&self.polylines.get(&line)?.points)
    }

    fn fit_bounds(&mut self, bounds: Bounds, padding: (u32, u32)) {
        if self.removed {
            return;
        }
        self.center = bounds.center();
        self.fitted = Some((bounds, padding));
    }

    fn add_circle(&mut self, center: LatLng, style: &CircleStyle) -> CircleId {
        let id = CircleId(self.next_id());
        if !self.removed {
            self.circles.insert(
                id,
                SceneCircle {
                    center,
                    style: style.clone(),
                },
            );
        }
        id
    }

    fn move_circle(&mut self, circle: CircleId, center: LatLng) {
        if let Some(c) = self.circles.get_mut(&circle) {
            c.center = center;
        }
    }

    fn remove_circle(&mut self, circle: CircleId) {
        self.circles.remove(&circle);
    }

    fn poll_event(&mut self) -> Option<MapEvent> {
        self.events.pop_front()
    }

    fn remove(&mut self) {
        self.removed = true;
        self.markers.clear();
        self.polylines.clear();
        self.circles.clear();
        self.groups.clear();
        self.events.clear();
    }
}
