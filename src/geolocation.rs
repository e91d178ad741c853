//! Continuous position watching.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::GEOLOCATION_TIMEOUT;
use crate::structs::LatLng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WatchOptions {
    pub enable_high_accuracy: bool,
    /// Oldest cached position that may be delivered.
    pub maximum_age: Duration,
    /// How long to wait for each position before failing.
    pub timeout: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            enable_high_accuracy: true,
            maximum_age: Duration::ZERO,
            timeout: GEOLOCATION_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Position {
    pub coords: LatLng,
    pub captured_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum GeolocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("no position within {0:?}")]
    Timeout(Duration),
    #[error("geolocation is not supported")]
    Unsupported,
}

pub type PositionResult = Result<Position, GeolocationError>;

/// An active watch. Dropping it clears the watch.
pub struct PositionWatch {
    rx: mpsc::UnboundedReceiver<PositionResult>,
    options: WatchOptions,
    started_at: DateTime<Utc>,
}

impl PositionWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<PositionResult>, options: WatchOptions) -> Self {
        PositionWatch {
            rx,
            options,
            started_at: Utc::now().trunc_subsecs(0),
        }
    }

    /// Next fresh position. Positions older than the allowed cache age are skipped.
    /// Cancel safe.
    pub async fn next(&mut self) -> PositionResult {
        loop {
            let received = tokio::time::timeout(self.options.timeout, self.rx.recv()).await;
            let position = match received {
                Err(_) => return Err(GeolocationError::Timeout(self.options.timeout)),
                Ok(None) => {
                    return Err(GeolocationError::PositionUnavailable(
                        "position source closed".to_string(),
                    ))
                }
                Ok(Some(result)) => result?,
            };

            let max_age = chrono::Duration::from_std(self.options.maximum_age)
                .unwrap_or_else(|_| chrono::Duration::zero());
            if position.captured_at + max_age < self.started_at {
                log::debug!("Discarding cached position from {}", position.captured_at);
                continue;
            }
            return Ok(position);
        }
    }

    pub fn clear(mut self) {
        self.rx.close();
    }
}

pub trait PositionSource: Send + 'static {
    fn watch_position(&mut self, options: WatchOptions) -> Result<PositionWatch, GeolocationError>;
}

/// Position source fed from outside (e.g. live-location updates relayed by the bot).
/// One watch at a time; a new watch replaces the previous one.
#[derive(Clone, Default)]
pub struct LiveLocationFeed {
    sink: Arc<Mutex<Option<mpsc::UnboundedSender<PositionResult>>>>,
}

impl LiveLocationFeed {
    /// Delivers a sample to the active watch. Returns false when nobody is watching.
    pub fn push(&self, position: Position) -> bool {
        self.deliver(Ok(position))
    }

    pub fn fail(&self, error: GeolocationError) -> bool {
        self.deliver(Err(error))
    }

    pub fn is_watched(&self) -> bool {
        self.sink
            .lock()
            .map(|s| s.as_ref().map_or(false, |tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    fn deliver(&self, result: PositionResult) -> bool {
        let Ok(mut sink) = self.sink.lock() else {
            return false;
        };
        let delivered = sink.as_ref().map_or(false, |tx| tx.send(result).is_ok());
        if !delivered {
            *sink = None;
        }
        delivered
    }
}

impl PositionSource for LiveLocationFeed {
    fn watch_position(&mut self, options: WatchOptions) -> Result<PositionWatch, GeolocationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| GeolocationError::Unsupported)?;
        *sink = Some(tx);
        Ok(PositionWatch::new(rx, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(lat: f64, lng: f64) -> Position {
        Position {
            coords: LatLng::new(lat, lng),
            captured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn feed_delivers_to_the_active_watch() {
        let mut feed = LiveLocationFeed::default();
        assert!(!feed.push(at(1.0, 1.0)));

        let mut watch = feed.watch_position(WatchOptions::default()).unwrap();
        assert!(feed.is_watched());
        assert!(feed.push(at(1.0, 2.0)));
        assert_eq!(watch.next().await.unwrap().coords, LatLng::new(1.0, 2.0));

        watch.clear();
        assert!(!feed.is_watched());
        assert!(!feed.push(at(1.0, 3.0)));
    }

    #[tokio::test]
    async fn cached_positions_are_skipped() {
        let mut feed = LiveLocationFeed::default();
        let mut watch = feed.watch_position(WatchOptions::default()).unwrap();

        feed.push(Position {
            coords: LatLng::new(9.0, 9.0),
            captured_at: Utc::now() - chrono::Duration::minutes(10),
        });
        feed.push(at(1.0, 2.0));
        assert_eq!(watch.next().await.unwrap().coords, LatLng::new(1.0, 2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let mut feed = LiveLocationFeed::default();
        let mut watch = feed.watch_position(WatchOptions::default()).unwrap();

        let err = watch.next().await.unwrap_err();
        assert_eq!(err, GeolocationError::Timeout(Duration::from_millis(5000)));
    }

    #[tokio::test]
    async fn device_errors_are_forwarded() {
        let mut feed = LiveLocationFeed::default();
        let mut watch = feed.watch_position(WatchOptions::default()).unwrap();

        feed.fail(GeolocationError::PermissionDenied);
        assert_eq!(watch.next().await.unwrap_err(), GeolocationError::PermissionDenied);
    }

    #[tokio::test]
    async fn a_new_watch_replaces_the_old_one() {
        let mut feed = LiveLocationFeed::default();
        let mut first = feed.watch_position(WatchOptions::default()).unwrap();
        let mut second = feed.watch_position(WatchOptions::default()).unwrap();

        feed.push(at(4.0, 4.0));
        assert_eq!(second.next().await.unwrap().coords, LatLng::new(4.0, 4.0));
        assert!(matches!(
            first.next().await,
            Err(GeolocationError::PositionUnavailable(_))
        ));
    }
}
