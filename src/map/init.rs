use std::time::Duration;

use super::*;
use crate::config::{
    DEFAULT_CENTER, DEFAULT_ZOOM, DIMENSION_RETRY_DELAY, MAX_ZOOM, MIN_CONTAINER_PX, MIN_ZOOM,
};

/// Re-checks `ready` every `delay` until it holds.
pub async fn retry_until<F>(delay: Duration, mut ready: F)
where
    F: FnMut() -> bool,
{
    while !ready() {
        tokio::time::sleep(delay).await;
    }
}

pub fn container_ready(container: &dyn MapContainer) -> bool {
    let (width, height) = container.client_size();
    width >= MIN_CONTAINER_PX && height >= MIN_CONTAINER_PX
}

pub fn default_options() -> MapOptions {
    MapOptions {
        center: DEFAULT_CENTER,
        zoom: DEFAULT_ZOOM,
        min_zoom: MIN_ZOOM,
        max_zoom: MAX_ZOOM,
    }
}

/// Loads the library, waits for the container to have real dimensions, then builds the
/// widget and hands it to a fresh [`MapSync`].
pub async fn mount<L: MapLoader>(
    loader: &L,
    container: &dyn MapContainer,
) -> Result<MapSync<<L::Library as MapLibrary>::Widget>, MapError> {
    let library = loader.load().await?;

    retry_until(DIMENSION_RETRY_DELAY, || {
        let ready = container_ready(container);
        if !ready {
            log::debug!("Map container has insufficient dimensions, waiting...");
        }
        ready
    })
    .await;

    let (width, height) = container.client_size();
    log::info!("Initializing map with dimensions: {width}x{height}");
    let widget = library.create_map(container, &default_options())?;
    Ok(MapSync::new(widget))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::scene::{SceneLoader, Viewport};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Container that only grows after a few layout passes.
    struct Growing {
        checks: Arc<AtomicU32>,
        ready_after: u32,
    }

    impl MapContainer for Growing {
        fn client_size(&self) -> (u32, u32) {
            let n = self.checks.fetch_add(1, Ordering::SeqCst);
            if n >= self.ready_after {
                (640, 480)
            } else {
                (640, 0)
            }
        }
    }

    struct FailingLoader;

    impl MapLoader for FailingLoader {
        type Library = crate::map::scene::SceneLibrary;

        async fn load(&self) -> Result<Self::Library, MapError> {
            Err(MapError::Load("script blocked".into()))
        }
    }

    #[tokio::test]
    async fn mounts_immediately_when_sized() {
        let map = mount(&SceneLoader, &Viewport::new(800, 600)).await.unwrap();
        let scene = map.widget();
        assert_eq!(scene.view(), (DEFAULT_CENTER, DEFAULT_ZOOM));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_container_dimensions() {
        let checks = Arc::new(AtomicU32::new(0));
        let container = Growing {
            checks: checks.clone(),
            ready_after: 3,
        };

        let started = tokio::time::Instant::now();
        let map = mount(&SceneLoader, &container).await;
        assert!(map.is_ok());
        assert!(started.elapsed() >= DIMENSION_RETRY_DELAY * 3);
    }

    #[tokio::test]
    async fn load_failure_is_reported() {
        let err = mount(&FailingLoader, &Viewport::new(800, 600)).await.err().unwrap();
        assert!(matches!(err, MapError::Load(_)));
    }

    #[test]
    fn tiny_containers_are_not_ready() {
        assert!(!container_ready(&Viewport::new(9, 600)));
        assert!(container_ready(&Viewport::new(10, 10)));
    }
}
