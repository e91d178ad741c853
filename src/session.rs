//! Per-chat dashboard actors.
//!
//! Every chat gets its own task owning a dashboard. Bot handlers talk to it through a
//! command channel and receive answers on oneshot channels, so a dashboard is only
//! ever touched from one task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use geojson::FeatureCollection;
use teloxide::{
    payloads::SendMessageSetters, prelude::*, types::ParseMode::Html, utils::html,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::api::{FirebaseAuth, FirebaseDatabase};
use crate::auth::Authenticator;
use crate::config::Config;
use crate::dashboard::{DriverDashboard, StudentDashboard};
use crate::geolocation::{LiveLocationFeed, Position, WatchOptions};
use crate::map::scene::{SceneLoader, SceneWidget, Viewport};
use crate::map::{self, MapError, MapSync, MapWidget};
use crate::store::RealtimeStore;
use crate::structs::{Bus, BusProfile, BusStop};
use crate::toast::{Toast, ToastVariant, Toaster};

//////////////////////////////////////////////////////////
// Toasts
//////////////////////////////////////////////////////////
/// Delivers toasts as chat messages. Only toasts with an explicit duration ring.
pub struct ChatToaster {
    bot: Bot,
    chat_id: ChatId,
}

impl ChatToaster {
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        ChatToaster { bot, chat_id }
    }
}

pub fn format_toast(toast: &Toast) -> String {
    let icon = match toast.variant {
        ToastVariant::Default => "🔔",
        ToastVariant::Destructive => "❌",
    };
    format!(
        "{icon} <b>{}</b>\n{}",
        html::escape(&toast.title),
        html::escape(&toast.description)
    )
}

impl Toaster for ChatToaster {
    fn toast(&self, toast: Toast) {
        let bot = self.bot.clone();
        let chat_id = self.chat_id;
        let text = format_toast(&toast);
        let silent = toast.duration.is_none();
        tokio::spawn(async move {
            if let Err(e) = bot
                .send_message(chat_id, text)
                .parse_mode(Html)
                .disable_notification(silent)
                .await
            {
                log::error!("Failed to deliver toast to chat {}: {e}", chat_id.0);
            }
        });
    }
}

//////////////////////////////////////////////////////////
// Driver actor
//////////////////////////////////////////////////////////
/// A spawned per-chat task.
pub trait Actor {
    /// True once the task has exited and the handle only answers `None`.
    fn is_finished(&self) -> bool;
}

pub enum DriverCommand {
    Login {
        email: String,
        password: String,
        reply: oneshot::Sender<bool>,
    },
    Logout(oneshot::Sender<()>),
    SaveProfile {
        profile: BusProfile,
        reply: oneshot::Sender<bool>,
    },
    ToggleTracking(oneshot::Sender<bool>),
    /// `None` while logged out.
    Profile(oneshot::Sender<Option<BusProfile>>),
    Status(oneshot::Sender<String>),
    Map(oneshot::Sender<Option<FeatureCollection>>),
}

pub struct DriverHandle {
    commands: mpsc::UnboundedSender<DriverCommand>,
    feed: LiveLocationFeed,
    task: JoinHandle<()>,
}

impl DriverHandle {
    pub fn spawn<A, S>(
        dashboard: DriverDashboard<A, S, LiveLocationFeed, SceneWidget>,
        feed: LiveLocationFeed,
    ) -> Self
    where
        A: Authenticator,
        S: RealtimeStore,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_driver(dashboard, rx));
        DriverHandle { commands, feed, task }
    }

    /// Sends a command and waits for its answer. `None` once the actor has exited.
    pub async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> DriverCommand,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).ok()?;
        rx.await.ok()
    }

    /// Relays a live-location sample. Returns false when tracking is off.
    pub fn push_location(&self, position: Position) -> bool {
        self.feed.push(position)
    }

    /// Closes the command channel and waits for the dashboard to tear down.
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            log::error!("Driver session ended abnormally: {e}");
        }
    }
}

impl Actor for DriverHandle {
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run_driver<A, S>(
    mut dashboard: DriverDashboard<A, S, LiveLocationFeed, SceneWidget>,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
) where
    A: Authenticator,
    S: RealtimeStore,
{
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => handle_driver_command(&mut dashboard, command).await,
                None => break,
            },
            event = dashboard.next_event() => dashboard.handle_event(event).await,
        }
    }
    dashboard.teardown().await;
}

async fn handle_driver_command<A, S>(
    dashboard: &mut DriverDashboard<A, S, LiveLocationFeed, SceneWidget>,
    command: DriverCommand,
) where
    A: Authenticator,
    S: RealtimeStore,
{
    // A dropped reply only means the requesting handler gave up.
    match command {
        DriverCommand::Login {
            email,
            password,
            reply,
        } => {
            let _ = reply.send(dashboard.login(&email, &password).await);
        }
        DriverCommand::Logout(reply) => {
            dashboard.logout().await;
            let _ = reply.send(());
        }
        DriverCommand::SaveProfile { profile, reply } => {
            let _ = reply.send(dashboard.submit_profile(profile).await);
        }
        DriverCommand::ToggleTracking(reply) => {
            let _ = reply.send(dashboard.toggle_tracking().await);
        }
        DriverCommand::Profile(reply) => {
            let profile = dashboard.user().map(|_| dashboard.profile().clone());
            let _ = reply.send(profile);
        }
        DriverCommand::Status(reply) => {
            let _ = reply.send(dashboard.status_text());
        }
        DriverCommand::Map(reply) => {
            let _ = reply.send(dashboard.map().map(|m| m.widget().to_geojson()));
        }
    }
}

//////////////////////////////////////////////////////////
// Student actor
//////////////////////////////////////////////////////////
pub enum StudentCommand {
    Buses(oneshot::Sender<Vec<Bus>>),
    /// Answers with the newly selected bus.
    SelectBus {
        bus_id: String,
        reply: oneshot::Sender<Option<Bus>>,
    },
    SelectStop {
        stop_id: String,
        reply: oneshot::Sender<Option<BusStop>>,
    },
    ToggleNotifications(oneshot::Sender<bool>),
    Summary(oneshot::Sender<String>),
    Map(oneshot::Sender<Option<FeatureCollection>>),
}

pub struct StudentHandle {
    commands: mpsc::UnboundedSender<StudentCommand>,
    task: JoinHandle<()>,
}

impl StudentHandle {
    pub fn spawn(dashboard: StudentDashboard<SceneWidget>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_student(dashboard, rx));
        StudentHandle { commands, task }
    }

    pub async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> StudentCommand,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            log::error!("Student session ended abnormally: {e}");
        }
    }
}

impl Actor for StudentHandle {
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run_student(
    mut dashboard: StudentDashboard<SceneWidget>,
    mut commands: mpsc::UnboundedReceiver<StudentCommand>,
) {
    // Commands queue up until the first bus snapshot is in.
    let first = dashboard.next_event().await;
    let mut live = dashboard.handle_event(first);

    while live {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => handle_student_command(&mut dashboard, command),
                None => break,
            },
            event = dashboard.next_event() => live = dashboard.handle_event(event),
        }
    }
    if !live {
        log::warn!("Bus feed ended, closing student session");
    }
    dashboard.teardown();
}

fn handle_student_command(dashboard: &mut StudentDashboard<SceneWidget>, command: StudentCommand) {
    match command {
        StudentCommand::Buses(reply) => {
            let _ = reply.send(dashboard.buses().to_vec());
        }
        StudentCommand::SelectBus { bus_id, reply } => {
            let selected = dashboard
                .select_bus(&bus_id)
                .then(|| dashboard.selected_bus().cloned())
                .flatten();
            let _ = reply.send(selected);
        }
        StudentCommand::SelectStop { stop_id, reply } => {
            let selected = dashboard
                .select_stop(&stop_id)
                .then(|| dashboard.selected_stop().cloned())
                .flatten();
            let _ = reply.send(selected);
        }
        StudentCommand::ToggleNotifications(reply) => {
            let _ = reply.send(dashboard.toggle_notifications());
        }
        StudentCommand::Summary(reply) => {
            let _ = reply.send(dashboard.summary());
        }
        StudentCommand::Map(reply) => {
            let _ = reply.send(dashboard.map().map(|m| m.widget().to_geojson()));
        }
    }
}

//////////////////////////////////////////////////////////
// Registry
//////////////////////////////////////////////////////////
type Registry<H> = Arc<Mutex<HashMap<ChatId, Arc<H>>>>;

/// Live sessions by chat, backed by Firebase.
#[derive(Clone)]
pub struct Sessions {
    bot: Bot,
    config: Arc<Config>,
    store: FirebaseDatabase,
    drivers: Registry<DriverHandle>,
    students: Registry<StudentHandle>,
}

impl Sessions {
    pub fn new(bot: Bot, config: Config) -> Self {
        Sessions {
            bot,
            store: FirebaseDatabase::new(&config.database_url),
            config: Arc::new(config),
            drivers: Arc::default(),
            students: Arc::default(),
        }
    }

    async fn mount_map(&self) -> Result<MapSync<SceneWidget>, MapError> {
        let (width, height) = self.config.viewport;
        map::mount(&SceneLoader, &Viewport::new(width, height)).await
    }

    pub async fn driver(&self, chat_id: ChatId) -> Arc<DriverHandle> {
        if let Some(handle) = lookup(&self.drivers, chat_id) {
            return handle;
        }

        let feed = LiveLocationFeed::default();
        let options = WatchOptions {
            timeout: self.config.geolocation_timeout,
            ..WatchOptions::default()
        };
        let toaster = Arc::new(ChatToaster::new(self.bot.clone(), chat_id));
        let mut dashboard = DriverDashboard::new(
            FirebaseAuth::new(&self.config.firebase_api_key),
            self.store.clone(),
            feed.clone(),
            toaster.clone(),
            options,
            self.config.route_history_limit,
        );
        if let Some(map) = mounted_or_toast(self.mount_map().await, toaster.as_ref()) {
            dashboard.attach_map(map);
        }
        log::info!("Driver session opened for chat {}", chat_id.0);

        let handle = Arc::new(DriverHandle::spawn(dashboard, feed));
        insert(&self.drivers, chat_id, handle)
    }

    /// Opens a student session, replacing one whose bus feed has ended.
    pub async fn student(&self, chat_id: ChatId) -> Arc<StudentHandle> {
        if let Some(handle) = lookup(&self.students, chat_id) {
            return handle;
        }

        let toaster = Arc::new(ChatToaster::new(self.bot.clone(), chat_id));
        let mut dashboard = StudentDashboard::new(&self.store, toaster.clone());
        if let Some(map) = mounted_or_toast(self.mount_map().await, toaster.as_ref()) {
            dashboard.attach_map(map);
        }
        log::info!("Student session opened for chat {}", chat_id.0);

        let handle = Arc::new(StudentHandle::spawn(dashboard));
        insert(&self.students, chat_id, handle)
    }

    /// Existing driver session, without opening one.
    pub fn find_driver(&self, chat_id: ChatId) -> Option<Arc<DriverHandle>> {
        lookup(&self.drivers, chat_id)
    }

    pub fn find_student(&self, chat_id: ChatId) -> Option<Arc<StudentHandle>> {
        lookup(&self.students, chat_id)
    }

    /// Returns false when the chat has no driver session or is not tracking.
    pub fn push_location(&self, chat_id: ChatId, position: Position) -> bool {
        lookup(&self.drivers, chat_id).map_or(false, |h| h.push_location(position))
    }

    pub async fn close_student(&self, chat_id: ChatId) {
        let removed = self
            .students
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&chat_id);
        if let Some(handle) = removed.and_then(|h| Arc::try_unwrap(h).ok()) {
            handle.shutdown().await;
        }
    }

    pub async fn close_driver(&self, chat_id: ChatId) {
        let removed = self
            .drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&chat_id);
        if let Some(handle) = removed.and_then(|h| Arc::try_unwrap(h).ok()) {
            handle.shutdown().await;
        }
    }
}

/// The dashboard runs without a map when mounting fails.
fn mounted_or_toast<W: MapWidget>(
    mounted: Result<MapSync<W>, MapError>,
    toaster: &dyn Toaster,
) -> Option<MapSync<W>> {
    match mounted {
        Ok(map) => Some(map),
        Err(e) => {
            log::error!("Map initialization failed: {e}");
            toaster.toast(Toast::error("Map unavailable", e.to_string()));
            None
        }
    }
}

/// Live handle for the chat. Handles whose task has exited are evicted.
fn lookup<H: Actor>(registry: &Registry<H>, chat_id: ChatId) -> Option<Arc<H>> {
    let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if registry.get(&chat_id).map_or(false, |h| h.is_finished()) {
        log::info!("Session for chat {} has ended", chat_id.0);
        registry.remove(&chat_id);
        return None;
    }
    registry.get(&chat_id).cloned()
}

/// Keeps an already registered live handle if another handler won the race.
fn insert<H: Actor>(registry: &Registry<H>, chat_id: ChatId, handle: Arc<H>) -> Arc<H> {
    let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = registry.get(&chat_id).filter(|h| !h.is_finished()) {
        return existing.clone();
    }
    registry.insert(chat_id, handle.clone());
    handle
}
