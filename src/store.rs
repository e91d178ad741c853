//! Realtime store boundary: keyed JSON writes and snapshot subscriptions.

use std::future::Future;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed stream event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("subscription cancelled by the server")]
    Cancelled,
    #[error("credentials were revoked")]
    AuthRevoked,
}

/// Point-in-time copy of the value stored at a path. `Null` means nothing is stored.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot(pub Value);

impl Snapshot {
    pub fn exists(&self) -> bool {
        !self.0.is_null()
    }

    pub fn val(&self) -> &Value {
        &self.0
    }
}

pub type SnapshotResult = Result<Snapshot, StoreError>;

/// Live listener on a store path. Dropping it stops the listener.
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<SnapshotResult>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        path: &str,
        rx: mpsc::UnboundedReceiver<SnapshotResult>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Subscription {
            path: path.to_string(),
            rx,
            task,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next snapshot in server order; `None` once the listener has ended. Cancel safe.
    pub async fn next(&mut self) -> Option<SnapshotResult> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Waits on an optional subscription; pends forever when there is none.
pub async fn next_snapshot(subscription: &mut Option<Subscription>) -> Option<SnapshotResult> {
    match subscription {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

pub trait RealtimeStore: Clone + Send + Sync + 'static {
    /// Replaces the value at `path`.
    fn set(&self, path: &str, value: Value) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delivers the current value at `path` and every later change.
    fn subscribe(&self, path: &str) -> Subscription;

    /// A handle that authenticates its requests with `id_token`.
    fn with_auth(&self, id_token: &str) -> Self;
}

//////////////////////////////////////////////////////////
// JSON tree
//////////////////////////////////////////////////////////
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Replaces the value at `path`; `Null` removes it.
pub fn apply_put(tree: &mut Value, path: &str, data: Value) {
    let segments = path_segments(path);
    let Some((last, parents)) = segments.split_last() else {
        *tree = data;
        return;
    };

    let mut node = &mut *tree;
    for segment in parents {
        if data.is_null() && node.get(*segment).is_none() {
            return;
        }
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(children) = node else {
            return;
        };
        node = children.entry(segment.to_string()).or_insert(Value::Null);
    }

    if data.is_null() {
        if let Some(m) = node.as_object_mut() {
            m.remove(*last);
        }
    } else {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Some(m) = node.as_object_mut() {
            m.insert(last.to_string(), data);
        }
    }
    prune_empty(tree, &segments);
}

/// Applies a put for every child of `data` below `path`.
pub fn apply_patch(tree: &mut Value, path: &str, data: Value) {
    let Value::Object(children) = data else {
        apply_put(tree, path, data);
        return;
    };
    for (key, child) in children {
        apply_put(tree, &format!("{}/{}", path.trim_end_matches('/'), key), child);
    }
}

/// Removing the last child of an object leaves nothing behind, as in the hosted store.
fn prune_empty(tree: &mut Value, segments: &[&str]) {
    for depth in (0..segments.len()).rev() {
        let pointer = format!("/{}", segments[..depth].join("/"));
        let node = if depth == 0 {
            Some(&mut *tree)
        } else {
            tree.pointer_mut(&pointer)
        };
        match node {
            Some(Value::Object(m)) if m.is_empty() => {}
            _ => return,
        }
        if depth == 0 {
            *tree = Value::Null;
        } else if let Some(Value::Object(parent)) = parent_of(tree, &segments[..depth]) {
            parent.remove(segments[depth - 1]);
        }
    }
}

fn parent_of<'a>(tree: &'a mut Value, segments: &[&str]) -> Option<&'a mut Value> {
    let (_, parents) = segments.split_last()?;
    if parents.is_empty() {
        Some(tree)
    } else {
        tree.pointer_mut(&format!("/{}", parents.join("/")))
    }
}

/// Value stored at `path`, `Null` when absent.
pub fn value_at(tree: &Value, path: &str) -> Value {
    let segments = path_segments(path);
    if segments.is_empty() {
        return tree.clone();
    }
    tree.pointer(&format!("/{}", segments.join("/")))
        .cloned()
        .unwrap_or(Value::Null)
}

//////////////////////////////////////////////////////////
// Event stream
//////////////////////////////////////////////////////////
#[derive(Debug, PartialEq)]
pub enum StreamEvent {
    Put { path: String, data: Value },
    Patch { path: String, data: Value },
    KeepAlive,
    Cancel,
    AuthRevoked,
}

#[derive(serde::Deserialize)]
struct EventPayload {
    path: String,
    data: Value,
}

/// Removes one complete `event:`/`data:` block from the front of `buffer`.
pub fn take_event_block(buffer: &mut Vec<u8>) -> Option<String> {
    let end = buffer.windows(2).position(|w| w == b"\n\n")?;
    let block: Vec<u8> = buffer.drain(..end + 2).collect();
    Some(String::from_utf8_lossy(&block).replace('\r', ""))
}

pub fn parse_event(block: &str) -> Result<Option<StreamEvent>, StoreError> {
    let mut name = None;
    let mut data = String::new();
    for line in block.lines() {
        if let Some(v) = line.strip_prefix("event:") {
            name = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("data:") {
            data.push_str(v.trim());
        }
    }

    let event = match name.as_deref() {
        Some("put") => {
            let p: EventPayload = serde_json::from_str(&data)?;
            StreamEvent::Put { path: p.path, data: p.data }
        }
        Some("patch") => {
            let p: EventPayload = serde_json::from_str(&data)?;
            StreamEvent::Patch { path: p.path, data: p.data }
        }
        Some("keep-alive") => StreamEvent::KeepAlive,
        Some("cancel") => StreamEvent::Cancel,
        Some("auth_revoked") => StreamEvent::AuthRevoked,
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Local mirror of a streamed path.
#[derive(Debug, Default)]
pub struct StreamedTree {
    tree: Value,
}

impl StreamedTree {
    /// Applies one event. Returns the new snapshot when the tree changed.
    pub fn apply(&mut self, event: StreamEvent) -> Result<Option<Snapshot>, StoreError> {
        match event {
            StreamEvent::Put { path, data } => apply_put(&mut self.tree, &path, data),
            StreamEvent::Patch { path, data } => apply_patch(&mut self.tree, &path, data),
            StreamEvent::KeepAlive => return Ok(None),
            StreamEvent::Cancel => return Err(StoreError::Cancelled),
            StreamEvent::AuthRevoked => return Err(StoreError::AuthRevoked),
        }
        Ok(Some(Snapshot(self.tree.clone())))
    }
}
