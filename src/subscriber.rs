use crate::store::{RealtimeStore, Snapshot, SnapshotResult, StoreError, Subscription};
use crate::structs::{decode_buses, Bus};

pub const BUSES_PATH: &str = "buses";

/// Mirrors the `buses` collection and keeps the selected bus fresh.
pub struct BusSubscriber {
    subscription: Option<Subscription>,
    buses: Vec<Bus>,
    selected: Option<Bus>,
}

impl BusSubscriber {
    pub fn subscribe<S: RealtimeStore>(store: &S) -> Self {
        BusSubscriber {
            subscription: Some(store.subscribe(BUSES_PATH)),
            buses: vec![],
            selected: None,
        }
    }

    pub fn buses(&self) -> &[Bus] {
        &self.buses
    }

    pub fn selected(&self) -> Option<&Bus> {
        self.selected.as_ref()
    }

    pub fn selected_mut(&mut self) -> Option<&mut Bus> {
        self.selected.as_mut()
    }

    /// Next raw snapshot; `None` once unsubscribed or the stream ended. Cancel safe.
    pub async fn next_snapshot(&mut self) -> Option<SnapshotResult> {
        crate::store::next_snapshot(&mut self.subscription).await
    }

    /// Replaces local state with the snapshot. Returns true when the bus list changed.
    pub fn apply(&mut self, snapshot: &Snapshot) -> bool {
        if !snapshot.exists() {
            return false;
        }
        self.buses = decode_buses(snapshot.val());

        self.selected = match self.selected.take() {
            None => self.buses.iter().find(|b| b.is_active()).cloned(),
            // Keep the selection if the record vanished from this snapshot
            Some(current) => Some(
                self.buses
                    .iter()
                    .find(|b| b.id == current.id)
                    .cloned()
                    .unwrap_or(current),
            ),
        };
        true
    }

    /// Handles one item from [`Self::next_snapshot`].
    pub fn handle(&mut self, item: SnapshotResult) -> Result<bool, StoreError> {
        let snapshot = item?;
        Ok(self.apply(&snapshot))
    }

    /// Explicit selection. Unknown ids leave the selection untouched.
    pub fn select(&mut self, bus_id: &str) -> Option<&Bus> {
        let bus = self.buses.iter().find(|b| b.id == bus_id)?.clone();
        self.selected = Some(bus);
        self.selected.as_ref()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    async fn pump(subscriber: &mut BusSubscriber) -> bool {
        let item = subscriber.next_snapshot().await.unwrap();
        subscriber.handle(item).unwrap()
    }

    #[tokio::test]
    async fn first_active_bus_is_auto_selected() {
        let store = MemoryStore::default();
        store.put(
            "buses",
            json!({
                "bus_a": { "name": "A", "status": "inactive" },
                "bus_b": { "name": "B", "status": "active" },
                "bus_c": { "name": "C", "status": "active" }
            }),
        );

        let mut subscriber = BusSubscriber::subscribe(&store);
        assert!(pump(&mut subscriber).await);
        assert_eq!(subscriber.buses().len(), 3);
        assert_eq!(subscriber.selected().unwrap().id, "bus_b");
    }

    #[tokio::test]
    async fn nothing_is_selected_without_an_active_bus() {
        let store = MemoryStore::default();
        store.put("buses/bus_a", json!({ "name": "A" }));

        let mut subscriber = BusSubscriber::subscribe(&store);
        pump(&mut subscriber).await;
        assert!(subscriber.selected().is_none());
    }

    #[tokio::test]
    async fn selection_is_refreshed_in_place() {
        let store = MemoryStore::default();
        store.put("buses/bus_a", json!({ "name": "A", "status": "active" }));
        store.put("buses/bus_b", json!({ "name": "B", "status": "active" }));

        let mut subscriber = BusSubscriber::subscribe(&store);
        pump(&mut subscriber).await;
        subscriber.select("bus_b");

        store.put("buses/bus_b/location", json!({ "lat": 1.0, "lng": 2.0, "timestamp": 9 }));
        pump(&mut subscriber).await;

        let selected = subscriber.selected().unwrap();
        assert_eq!(selected.id, "bus_b");
        assert_eq!(selected.location.unwrap().timestamp, 9);
    }

    #[tokio::test]
    async fn missing_collection_leaves_state_alone() {
        let store = MemoryStore::default();
        let mut subscriber = BusSubscriber::subscribe(&store);
        assert!(!pump(&mut subscriber).await);
        assert!(subscriber.buses().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_releases_the_listener() {
        let store = MemoryStore::default();
        let mut subscriber = BusSubscriber::subscribe(&store);
        assert_eq!(store.listener_count(), 1);

        subscriber.unsubscribe();
        assert_eq!(store.listener_count(), 0);
    }
}
