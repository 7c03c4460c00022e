// Copyright (C) 2026 Botdeck Developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use botdeck_common::{
    AntiAfkConfig, BotAction, BotConfig, BotData, BotIdentity, BotStatus, BotSummary,
    DATA_EMIT_INTERVAL_MS, DEDUP_WINDOW_MS, FeatureToggles, HISTORY_CAPACITY,
    INVENTORY_COALESCE_MS, ItemStack, MessageKind, MessageRecord, NotificationKind,
    PLAYER_LIST_COALESCE_MS, PlayerInfo, REJOIN_DELAY_MS, ServerEvent, SpamOrder, SpammerConfig,
    ViewerCommand, flatten, legacy_to_ansi, parse_reason, strip_format_codes,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    registry: Arc<BotRegistry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dashboard_service=debug,tower_http=info".into()),
        )
        .init();

    let data_dir = PathBuf::from(
        std::env::var("BOTDECK_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
    );
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let store = ConfigStore::new(&data_dir);
    let registry = BotRegistry::new(store, Arc::new(LineConnector));
    registry.load_persisted().await;

    let app = build_router(AppState {
        registry: Arc::clone(&registry),
    });

    let addr: SocketAddr = std::env::var("DASHBOARD_BIND")
        .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
        .parse()
        .context("invalid DASHBOARD_BIND address")?;
    info!(%addr, "dashboard-service listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "dashboard-service" }))
}

// ---------------------------------------------------------------------------
// Websocket fanout
// ---------------------------------------------------------------------------

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let viewer_id = Uuid::new_v4();
    info!(viewer = %viewer_id, "viewer connected");

    let settings = state.registry.settings().await;
    if send_event(&mut socket, &ServerEvent::Settings { settings })
        .await
        .is_err()
    {
        return;
    }
    let bots = state.registry.list_all().await;
    if send_event(&mut socket, &ServerEvent::BotList { bots })
        .await
        .is_err()
    {
        return;
    }

    let mut bus_rx = state.registry.subscribe();
    let mut selected: Option<BotIdentity> = None;

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let command = match serde_json::from_str::<ViewerCommand>(&text) {
                            Ok(command) => command,
                            Err(error) => {
                                debug!(viewer = %viewer_id, error = %error, "ignoring malformed viewer frame");
                                continue;
                            }
                        };
                        if handle_viewer_command(&state, &mut socket, &mut selected, command)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(viewer = %viewer_id, error = %error, "viewer socket error");
                        break;
                    }
                }
            }
            event = bus_rx.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(viewer = %viewer_id, skipped, "viewer fell behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!(viewer = %viewer_id, "viewer disconnected");
}

async fn handle_viewer_command(
    state: &AppState,
    socket: &mut WebSocket,
    selected: &mut Option<BotIdentity>,
    command: ViewerCommand,
) -> Result<(), ()> {
    match command {
        ViewerCommand::CreateBot { config } => {
            let username = config.username.clone();
            match state.registry.create(config, true).await {
                Ok(()) => {
                    let _ = state
                        .registry
                        .command(&username, BotCommand::Connect)
                        .await;
                    send_event(
                        socket,
                        &notification(NotificationKind::Success, format!("Bot {username} created")),
                    )
                    .await?;
                    broadcast_bot_list(&state.registry).await;
                }
                Err(error) => {
                    send_event(socket, &notification(NotificationKind::Error, error.to_string()))
                        .await?;
                }
            }
        }
        ViewerCommand::EditBot { config } => {
            let username = config.username.clone();
            match state.registry.update(config).await {
                Ok(()) => {
                    send_event(
                        socket,
                        &notification(NotificationKind::Success, format!("Bot {username} updated")),
                    )
                    .await?;
                    broadcast_bot_list(&state.registry).await;
                }
                Err(error) => {
                    send_event(socket, &notification(NotificationKind::Error, error.to_string()))
                        .await?;
                }
            }
        }
        ViewerCommand::SelectBot { username } => {
            debug!(previous = ?selected, next = %username, "viewer selected bot");
            *selected = Some(username.clone());
            send_catch_up(&state.registry, socket, &username).await?;
        }
        ViewerCommand::BotAction {
            username,
            action,
            payload,
        } => {
            if let Some(event) = dispatch_action(&state.registry, &username, action, payload).await
            {
                send_event(socket, &event).await?;
            }
        }
        ViewerCommand::Control {
            username,
            control,
            state: pressed,
        } => {
            let _ = state
                .registry
                .command(&username, BotCommand::Control { control, state: pressed })
                .await;
        }
        ViewerCommand::SaveSettings { settings } => match state.registry.save_settings(settings).await {
            Ok(merged) => {
                let _ = state
                    .registry
                    .bus_send(ServerEvent::Settings { settings: merged });
            }
            Err(error) => {
                warn!(error = %error, "failed to save settings");
                send_event(socket, &notification(NotificationKind::Error, error.to_string()))
                    .await?;
            }
        },
    }
    Ok(())
}

/// Routes a viewer bot action to the owning worker. Returns a notification
/// for the requesting viewer when the action cannot be carried out.
async fn dispatch_action(
    registry: &Arc<BotRegistry>,
    username: &str,
    action: BotAction,
    payload: serde_json::Value,
) -> Option<ServerEvent> {
    let result = match action {
        BotAction::Chat => {
            let Some(message) = payload.get("message").and_then(|v| v.as_str()) else {
                return Some(notification(
                    NotificationKind::Error,
                    "chat action requires a message",
                ));
            };
            registry
                .command(username, BotCommand::Chat(message.to_string()))
                .await
        }
        BotAction::Move => {
            return Some(notification(
                NotificationKind::Error,
                "Navigation feature not available",
            ));
        }
        BotAction::ToggleView => {
            return Some(notification(
                NotificationKind::Error,
                "Viewer feature not available",
            ));
        }
        BotAction::ToggleKillaura => {
            registry
                .command(
                    username,
                    BotCommand::ToggleFeature {
                        name: "combat".to_string(),
                        enabled: enabled_flag(&payload),
                        config: None,
                    },
                )
                .await
        }
        BotAction::ToggleAntiAfk => {
            registry
                .command(
                    username,
                    BotCommand::ToggleFeature {
                        name: "antiafk".to_string(),
                        enabled: enabled_flag(&payload),
                        config: None,
                    },
                )
                .await
        }
        BotAction::ToggleAutoAuth => {
            registry
                .command(
                    username,
                    BotCommand::ToggleFeature {
                        name: "autoauth".to_string(),
                        enabled: enabled_flag(&payload),
                        config: None,
                    },
                )
                .await
        }
        BotAction::ToggleSpammer => {
            let enabled = enabled_flag(&payload);
            let mut patch = payload
                .get("config")
                .cloned()
                .unwrap_or_else(|| json!({}));
            if let Some(map) = patch.as_object_mut() {
                map.insert("enabled".to_string(), json!(enabled));
            }
            match registry.persist_spammer(username, &patch).await {
                Ok(()) => {
                    registry
                        .command(
                            username,
                            BotCommand::ToggleFeature {
                                name: "spammer".to_string(),
                                enabled,
                                config: Some(patch),
                            },
                        )
                        .await
                }
                Err(error) => Err(error),
            }
        }
        BotAction::ToggleAutoReconnect => {
            registry
                .set_auto_reconnect(username, enabled_flag(&payload))
                .await
        }
        BotAction::Rejoin => registry.command(username, BotCommand::Rejoin).await,
        BotAction::SetLook => {
            let yaw = payload.get("yaw").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let pitch = payload.get("pitch").and_then(|v| v.as_f64()).unwrap_or(0.0);
            registry
                .command(username, BotCommand::SetLook { yaw, pitch })
                .await
        }
        BotAction::Suicide => {
            registry
                .command(username, BotCommand::Chat("/kill".to_string()))
                .await
        }
        BotAction::Stop => registry.command(username, BotCommand::Stop).await,
        BotAction::Click => {
            let right = payload.get("type").and_then(|v| v.as_str()) == Some("right");
            registry.command(username, BotCommand::Click { right }).await
        }
        BotAction::Delete => {
            let result = registry.remove(username).await;
            if result.is_ok() {
                broadcast_bot_list(registry).await;
            }
            result
        }
    };

    match result {
        Ok(()) => None,
        Err(error) => {
            warn!(username, ?action, error = %error, "bot action failed");
            Some(notification(NotificationKind::Error, error.to_string()))
        }
    }
}

fn enabled_flag(payload: &serde_json::Value) -> bool {
    payload
        .get("enabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn notification(kind: NotificationKind, message: impl Into<String>) -> ServerEvent {
    ServerEvent::Notification {
        kind,
        message: message.into(),
    }
}

/// Hydrates a viewer that selected a bot: full status, cached telemetry and
/// the bounded chat history, pushed only to the requesting socket.
async fn send_catch_up(
    registry: &Arc<BotRegistry>,
    socket: &mut WebSocket,
    username: &str,
) -> Result<(), ()> {
    let Some(snapshot) = registry.snapshot(username).await else {
        return send_event(
            socket,
            &notification(NotificationKind::Error, format!("bot {username} not found")),
        )
        .await;
    };

    send_event(
        socket,
        &ServerEvent::BotStatus {
            username: username.to_string(),
            status: snapshot.status,
        },
    )
    .await?;
    if let Some(data) = snapshot.data {
        send_event(
            socket,
            &ServerEvent::BotData {
                username: username.to_string(),
                data,
            },
        )
        .await?;
    }
    send_event(
        socket,
        &ServerEvent::ChatHistory {
            username: username.to_string(),
            history: snapshot.history,
        },
    )
    .await?;
    send_event(
        socket,
        &ServerEvent::BotPlayers {
            username: username.to_string(),
            players: snapshot.players,
        },
    )
    .await?;
    send_event(
        socket,
        &ServerEvent::BotInventory {
            username: username.to_string(),
            items: snapshot.inventory,
        },
    )
    .await?;
    send_event(
        socket,
        &ServerEvent::BotToggles {
            username: username.to_string(),
            toggles: snapshot.toggles,
        },
    )
    .await?;
    send_event(
        socket,
        &ServerEvent::SpammerConfig {
            username: username.to_string(),
            config: snapshot.spammer,
        },
    )
    .await
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(error = %error, "failed to encode server event");
            return Ok(());
        }
    };
    socket
        .send(Message::Text(payload.into()))
        .await
        .map_err(|error| {
            debug!(error = %error, "failed to push event to viewer");
        })
}

async fn broadcast_bot_list(registry: &Arc<BotRegistry>) {
    let bots = registry.list_all().await;
    let _ = registry.bus_send(ServerEvent::BotList { bots });
}

// ---------------------------------------------------------------------------
// Bot registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum RegistryError {
    DuplicateIdentity(String),
    NotFound(String),
    Storage(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateIdentity(username) => write!(f, "bot {username} already exists"),
            Self::NotFound(username) => write!(f, "bot {username} not found"),
            Self::Storage(message) => write!(f, "storage error: {message}"),
        }
    }
}

impl std::error::Error for RegistryError {}

struct BotHandle {
    shared: Arc<Mutex<BotShared>>,
    control: mpsc::UnboundedSender<BotCommand>,
    task: JoinHandle<()>,
}

/// Cached per-bot state a viewer needs when it selects a bot.
struct BotSnapshot {
    status: BotStatus,
    config: BotConfig,
    data: Option<BotData>,
    history: Vec<MessageRecord>,
    players: Vec<PlayerInfo>,
    inventory: Vec<ItemStack>,
    toggles: FeatureToggles,
    spammer: SpammerConfig,
}

struct BotRegistry {
    bots: Mutex<HashMap<BotIdentity, BotHandle>>,
    bus: broadcast::Sender<ServerEvent>,
    store: ConfigStore,
    connector: Arc<dyn Connector>,
}

impl BotRegistry {
    fn new(store: ConfigStore, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (bus, _) = broadcast::channel(512);
        Arc::new(Self {
            bots: Mutex::new(HashMap::new()),
            bus,
            store,
            connector,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.bus.subscribe()
    }

    fn bus_send(&self, event: ServerEvent) -> usize {
        self.bus.send(event).unwrap_or(0)
    }

    async fn settings(&self) -> serde_json::Value {
        self.store.load_settings().await
    }

    async fn save_settings(&self, patch: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        self.store.save_settings(patch).await
    }

    async fn create(&self, config: BotConfig, persist: bool) -> Result<(), RegistryError> {
        let username = config.username.clone();
        let mut bots = self.bots.lock().await;
        if bots.contains_key(&username) {
            return Err(RegistryError::DuplicateIdentity(username));
        }
        if persist {
            self.store
                .save_bot(&config)
                .await
                .map_err(|error| RegistryError::Storage(error.to_string()))?;
        }
        let handle = self.spawn_bot(config);
        bots.insert(username.clone(), handle);
        drop(bots);
        info!(username = %username, "bot registered");
        let _ = self.bus.send(ServerEvent::BotStatus {
            username,
            status: BotStatus::Created,
        });
        Ok(())
    }

    /// Replaces a bot's config in place. The running session is untouched;
    /// the new parameters apply on the next (re)connect.
    async fn update(&self, config: BotConfig) -> Result<(), RegistryError> {
        let username = config.username.clone();
        let bots = self.bots.lock().await;
        let handle = bots
            .get(&username)
            .ok_or_else(|| RegistryError::NotFound(username.clone()))?;
        self.store
            .save_bot(&config)
            .await
            .map_err(|error| RegistryError::Storage(error.to_string()))?;
        handle
            .control
            .send(BotCommand::UpdateConfig(config))
            .map_err(|_| RegistryError::NotFound(username))
    }

    async fn remove(&self, username: &str) -> Result<(), RegistryError> {
        let removed = self.bots.lock().await.remove(username);
        if let Some(handle) = removed {
            if handle.control.send(BotCommand::Shutdown).is_err() {
                handle.task.abort();
            }
            let _ = self.bus.send(ServerEvent::BotRemoved {
                username: username.to_string(),
            });
            info!(username, "bot removed");
        }
        self.store
            .remove_bot(username)
            .await
            .map_err(|error| RegistryError::Storage(error.to_string()))
    }

    async fn command(&self, username: &str, command: BotCommand) -> Result<(), RegistryError> {
        let bots = self.bots.lock().await;
        let handle = bots
            .get(username)
            .ok_or_else(|| RegistryError::NotFound(username.to_string()))?;
        handle
            .control
            .send(command)
            .map_err(|_| RegistryError::NotFound(username.to_string()))
    }

    /// Merges a spammer config patch into the bot's stored config.
    async fn persist_spammer(
        &self,
        username: &str,
        patch: &serde_json::Value,
    ) -> Result<(), RegistryError> {
        let config = {
            let bots = self.bots.lock().await;
            let handle = bots
                .get(username)
                .ok_or_else(|| RegistryError::NotFound(username.to_string()))?;
            let mut shared = handle.shared.lock().await;
            let current = shared.config.spammer.clone().unwrap_or_default();
            shared.config.spammer = Some(merge_spammer_config(&current, patch));
            shared.config.clone()
        };
        self.store
            .save_bot(&config)
            .await
            .map_err(|error| RegistryError::Storage(error.to_string()))
    }

    async fn set_auto_reconnect(&self, username: &str, enabled: bool) -> Result<(), RegistryError> {
        let config = {
            let bots = self.bots.lock().await;
            let handle = bots
                .get(username)
                .ok_or_else(|| RegistryError::NotFound(username.to_string()))?;
            let mut shared = handle.shared.lock().await;
            shared.config.auto_reconnect = enabled;
            shared.config.clone()
        };
        self.store
            .save_bot(&config)
            .await
            .map_err(|error| RegistryError::Storage(error.to_string()))?;
        self.command(username, BotCommand::SetAutoReconnect(enabled))
            .await
    }

    async fn list_all(&self) -> Vec<BotSummary> {
        let bots = self.bots.lock().await;
        let mut summaries = Vec::with_capacity(bots.len());
        for handle in bots.values() {
            let shared = handle.shared.lock().await;
            summaries.push(BotSummary {
                username: shared.config.username.clone(),
                status: shared.status,
                host: shared.config.host.clone(),
                port: shared.config.port,
                config: shared.config.clone(),
            });
        }
        summaries.sort_by(|a, b| a.username.cmp(&b.username));
        summaries
    }

    async fn snapshot(&self, username: &str) -> Option<BotSnapshot> {
        let bots = self.bots.lock().await;
        let handle = bots.get(username)?;
        let shared = handle.shared.lock().await;
        Some(BotSnapshot {
            status: shared.status,
            config: shared.config.clone(),
            data: shared.last_data.clone(),
            history: shared.history.iter().cloned().collect(),
            players: shared.players.clone(),
            inventory: shared.inventory.clone(),
            toggles: shared.toggles.clone(),
            spammer: shared.config.spammer.clone().unwrap_or_default(),
        })
    }

    /// Restores saved bots on startup. Everything is registered before the
    /// first connect fires so the bot list is complete from the outset.
    async fn load_persisted(&self) {
        let configs = match self.store.load_bots().await {
            Ok(configs) => configs,
            Err(error) => {
                warn!(error = %error, "failed to load persisted bot configs");
                return;
            }
        };
        let mut restored = Vec::new();
        for config in configs {
            let username = config.username.clone();
            match self.create(config, false).await {
                Ok(()) => restored.push(username),
                Err(error) => warn!(username = %username, error = %error, "failed to restore saved bot"),
            }
        }
        info!(count = restored.len(), "restored persisted bots");
        for username in restored {
            let _ = self.command(&username, BotCommand::Connect).await;
        }
    }

    fn spawn_bot(&self, config: BotConfig) -> BotHandle {
        let username = config.username.clone();
        let shared = Arc::new(Mutex::new(BotShared {
            config: config.clone(),
            status: BotStatus::Created,
            history: VecDeque::new(),
            last_data: None,
            last_spawn: None,
            players: Vec::new(),
            inventory: Vec::new(),
            toggles: initial_toggles(&config),
        }));
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(forward_local_events(
            username.clone(),
            Arc::clone(&shared),
            local_rx,
            self.bus.clone(),
        ));

        let worker = BotWorker::new(
            username,
            Arc::clone(&shared),
            Arc::clone(&self.connector),
            local_tx,
            control_rx,
            &config,
        );
        let task = tokio::spawn(worker.run());

        BotHandle {
            shared,
            control: control_tx,
            task,
        }
    }
}

fn initial_toggles(config: &BotConfig) -> FeatureToggles {
    FeatureToggles {
        killaura: false,
        anti_afk: config.anti_afk.as_ref().map(|c| c.enabled).unwrap_or(false),
        auto_auth: config.auto_auth.as_ref().map(|c| c.enabled).unwrap_or(true),
        spammer: config.spammer.as_ref().map(|c| c.enabled).unwrap_or(false),
        auto_reconnect: config.auto_reconnect,
    }
}

/// Tags a bot's local events with its identity, records chat/log lines into
/// the bounded history and republishes everything on the shared bus.
async fn forward_local_events(
    username: BotIdentity,
    shared: Arc<Mutex<BotShared>>,
    mut local_rx: mpsc::UnboundedReceiver<LocalEvent>,
    bus: broadcast::Sender<ServerEvent>,
) {
    while let Some(event) = local_rx.recv().await {
        let event = match event {
            LocalEvent::Status(status) => ServerEvent::BotStatus {
                username: username.clone(),
                status,
            },
            LocalEvent::Chat {
                sender,
                message,
                raw,
                kind,
            } => {
                {
                    let mut shared = shared.lock().await;
                    push_record(
                        &mut shared.history,
                        MessageRecord {
                            sender: sender.clone(),
                            message: message.clone(),
                            raw_text: raw,
                            kind,
                            timestamp: Utc::now(),
                        },
                    );
                }
                ServerEvent::BotChat {
                    username: username.clone(),
                    sender,
                    message,
                    kind,
                }
            }
            LocalEvent::Log { message, kind } => {
                {
                    let mut shared = shared.lock().await;
                    push_record(
                        &mut shared.history,
                        MessageRecord {
                            sender: String::new(),
                            message: message.clone(),
                            raw_text: strip_format_codes(&message),
                            kind,
                            timestamp: Utc::now(),
                        },
                    );
                }
                ServerEvent::BotLog {
                    username: username.clone(),
                    message,
                    kind,
                }
            }
            LocalEvent::Data(data) => ServerEvent::BotData {
                username: username.clone(),
                data,
            },
            LocalEvent::Inventory(items) => ServerEvent::BotInventory {
                username: username.clone(),
                items,
            },
            LocalEvent::Players(players) => ServerEvent::BotPlayers {
                username: username.clone(),
                players,
            },
            LocalEvent::Toggles(toggles) => ServerEvent::BotToggles {
                username: username.clone(),
                toggles,
            },
            LocalEvent::SpammerConfig(config) => ServerEvent::SpammerConfig {
                username: username.clone(),
                config,
            },
            LocalEvent::Notification { kind, message } => {
                ServerEvent::Notification { kind, message }
            }
        };
        let _ = bus.send(event);
    }
}

fn push_record(history: &mut VecDeque<MessageRecord>, record: MessageRecord) {
    history.push_back(record);
    while history.len() > HISTORY_CAPACITY {
        history.pop_front();
    }
}

// ---------------------------------------------------------------------------
// Bot worker
// ---------------------------------------------------------------------------

/// Control-plane commands addressed to one bot's worker task.
#[derive(Debug)]
enum BotCommand {
    Connect,
    Stop,
    Rejoin,
    Chat(String),
    SetLook { yaw: f64, pitch: f64 },
    Control { control: String, state: bool },
    Click { right: bool },
    ToggleFeature {
        name: String,
        enabled: bool,
        config: Option<serde_json::Value>,
    },
    SetAutoReconnect(bool),
    UpdateConfig(BotConfig),
    Shutdown,
}

/// Events a worker publishes about itself, before identity tagging.
enum LocalEvent {
    Status(BotStatus),
    Chat {
        sender: String,
        message: String,
        raw: String,
        kind: MessageKind,
    },
    Log {
        message: String,
        kind: MessageKind,
    },
    Data(BotData),
    Inventory(Vec<ItemStack>),
    Players(Vec<PlayerInfo>),
    Toggles(FeatureToggles),
    SpammerConfig(SpammerConfig),
    Notification {
        kind: NotificationKind,
        message: String,
    },
}

/// State readable outside the worker task: the worker writes, the registry
/// reads for bot-list summaries and select-bot snapshots.
struct BotShared {
    config: BotConfig,
    status: BotStatus,
    history: VecDeque<MessageRecord>,
    last_data: Option<BotData>,
    last_spawn: Option<DateTime<Utc>>,
    players: Vec<PlayerInfo>,
    inventory: Vec<ItemStack>,
    toggles: FeatureToggles,
}

struct BotWorker {
    identity: BotIdentity,
    shared: Arc<Mutex<BotShared>>,
    connector: Arc<dyn Connector>,
    local_tx: mpsc::UnboundedSender<LocalEvent>,
    control_rx: mpsc::UnboundedReceiver<BotCommand>,
    session: Option<Session>,
    features: FeatureRegistry,
    dedup: DedupWindow,
    manual_stop: bool,
    reconnect_at: Option<Instant>,
    last_data_emit: Option<Instant>,
    players: Vec<PlayerInfo>,
    players_flush_at: Option<Instant>,
    pending_inventory: Option<Vec<ItemStack>>,
    inventory_flush_at: Option<Instant>,
}

impl BotWorker {
    fn new(
        identity: BotIdentity,
        shared: Arc<Mutex<BotShared>>,
        connector: Arc<dyn Connector>,
        local_tx: mpsc::UnboundedSender<LocalEvent>,
        control_rx: mpsc::UnboundedReceiver<BotCommand>,
        config: &BotConfig,
    ) -> Self {
        let mut features = FeatureRegistry::new();
        let api = FeatureApi {
            session: None,
            local: local_tx.clone(),
        };
        features.register("combat", Box::new(CombatFeature::default()), false, &api);
        features.register(
            "antiafk",
            Box::new(AntiAfkFeature::from_config(config.anti_afk.as_ref())),
            config.anti_afk.as_ref().map(|c| c.enabled).unwrap_or(false),
            &api,
        );
        features.register(
            "autoauth",
            Box::new(AutoAuthFeature::from_config(config)),
            config.auto_auth.as_ref().map(|c| c.enabled).unwrap_or(true),
            &api,
        );
        features.register(
            "spammer",
            Box::new(SpammerFeature::new(
                config.spammer.clone().unwrap_or_default(),
            )),
            config.spammer.as_ref().map(|c| c.enabled).unwrap_or(false),
            &api,
        );

        Self {
            identity,
            shared,
            connector,
            local_tx,
            control_rx,
            session: None,
            features,
            dedup: DedupWindow::new(Duration::from_millis(DEDUP_WINDOW_MS)),
            manual_stop: false,
            reconnect_at: None,
            last_data_emit: None,
            players: Vec::new(),
            players_flush_at: None,
            pending_inventory: None,
            inventory_flush_at: None,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.control_rx.recv() => {
                    match command {
                        Some(BotCommand::Shutdown) | None => {
                            self.handle_stop().await;
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                    }
                }
                event = recv_session_event(&mut self.session) => {
                    match event {
                        Some(event) => self.handle_session_event(event).await,
                        None => self.handle_session_event(SessionEvent::Disconnected).await,
                    }
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    if !self.manual_stop {
                        self.connect().await;
                    }
                }
                _ = sleep_until_opt(self.players_flush_at) => {
                    self.flush_players().await;
                }
                _ = sleep_until_opt(self.inventory_flush_at) => {
                    self.flush_inventory().await;
                }
            }
        }
        debug!(identity = %self.identity, "bot worker exited");
    }

    fn api(&self) -> FeatureApi {
        FeatureApi {
            session: self.session.as_ref().map(|s| s.commands.clone()),
            local: self.local_tx.clone(),
        }
    }

    fn emit(&self, event: LocalEvent) {
        let _ = self.local_tx.send(event);
    }

    fn log(&self, message: String, kind: MessageKind) {
        self.emit(LocalEvent::Log { message, kind });
    }

    async fn set_status(&self, status: BotStatus) {
        self.shared.lock().await.status = status;
        self.emit(LocalEvent::Status(status));
    }

    async fn connect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.commands.send(SessionCommand::Quit);
        }
        self.manual_stop = false;
        let config = self.shared.lock().await.config.clone();
        match self.connector.connect(&config).await {
            Ok(session) => {
                self.session = Some(session);
                self.log(
                    format!("Connecting to {}:{}", config.host, config.port),
                    MessageKind::Info,
                );
                self.set_status(BotStatus::Connecting).await;
            }
            Err(error) => {
                warn!(identity = %self.identity, error = %error, "failed to construct session");
                self.log(format!("Fatal connect error: {error}"), MessageKind::Error);
                self.set_status(BotStatus::FatalError).await;
            }
        }
    }

    async fn handle_stop(&mut self) {
        self.manual_stop = true;
        self.reconnect_at = None;
        if let Some(session) = self.session.take() {
            let _ = session.commands.send(SessionCommand::Quit);
        }
        let already_stopped = self.shared.lock().await.status == BotStatus::Stopped;
        if !already_stopped {
            self.log(format!("{} stopped", self.identity), MessageKind::Warning);
            self.set_status(BotStatus::Stopped).await;
        }
    }

    async fn handle_rejoin(&mut self) {
        self.log("Rejoining server...".to_string(), MessageKind::Warning);
        if let Some(session) = self.session.take() {
            let _ = session.commands.send(SessionCommand::Quit);
        }
        self.manual_stop = false;
        self.set_status(BotStatus::Reconnecting).await;
        self.reconnect_at = Some(Instant::now() + Duration::from_millis(REJOIN_DELAY_MS));
    }

    async fn handle_command(&mut self, command: BotCommand) {
        match command {
            BotCommand::Connect => self.connect().await,
            BotCommand::Stop => self.handle_stop().await,
            BotCommand::Rejoin => self.handle_rejoin().await,
            BotCommand::Chat(message) => match &self.session {
                Some(session) => {
                    let _ = session.commands.send(SessionCommand::SendChat(message));
                }
                None => self.log(
                    "Cannot send chat: not connected".to_string(),
                    MessageKind::Warning,
                ),
            },
            BotCommand::SetLook { yaw, pitch } => {
                if let Some(session) = &self.session {
                    let _ = session.commands.send(SessionCommand::LookAt { yaw, pitch });
                }
            }
            BotCommand::Control { control, state } => {
                if let Some(session) = &self.session {
                    let _ = session
                        .commands
                        .send(SessionCommand::SetControlState { control, state });
                }
            }
            BotCommand::Click { right } => {
                if let Some(session) = &self.session {
                    let command = if right {
                        SessionCommand::UseItem
                    } else {
                        SessionCommand::Swing
                    };
                    let _ = session.commands.send(command);
                }
            }
            BotCommand::ToggleFeature {
                name,
                enabled,
                config,
            } => {
                let api = self.api();
                if let Some(config) = config.as_ref() {
                    self.features.on_config_update(&name, &api, config);
                }
                if enabled {
                    self.features.enable(&name, &api);
                } else {
                    self.features.disable(&name, &api);
                }
                self.emit_toggles().await;
                if name == "spammer" {
                    let config = self
                        .shared
                        .lock()
                        .await
                        .config
                        .spammer
                        .clone()
                        .unwrap_or_default();
                    self.emit(LocalEvent::SpammerConfig(config));
                }
            }
            BotCommand::SetAutoReconnect(enabled) => {
                let label = if enabled { "enabled" } else { "disabled" };
                self.log(format!("Auto reconnect {label}"), MessageKind::Info);
                self.emit_toggles().await;
            }
            BotCommand::UpdateConfig(config) => {
                let spammer = config.spammer.clone();
                self.shared.lock().await.config = config;
                if let Some(spammer) = spammer {
                    if let Ok(value) = serde_json::to_value(&spammer) {
                        let api = self.api();
                        self.features.on_config_update("spammer", &api, &value);
                    }
                }
                self.log("Configuration updated".to_string(), MessageKind::Info);
                self.emit_toggles().await;
            }
            BotCommand::Shutdown => {}
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Spawn => {
                self.shared.lock().await.last_spawn = Some(Utc::now());
                self.set_status(BotStatus::Online).await;
                self.log(format!("{} spawned", self.identity), MessageKind::Success);
                let api = self.api();
                self.features.on_spawn(&api);
                self.emit_toggles().await;
                self.schedule_players_flush();
            }
            SessionEvent::Disconnected => {
                self.session = None;
                // A pending timer or a manual stop already owns the outcome.
                if self.manual_stop || self.reconnect_at.is_some() {
                    return;
                }
                self.set_status(BotStatus::Offline).await;
                let (config, last_spawn) = {
                    let shared = self.shared.lock().await;
                    (shared.config.clone(), shared.last_spawn)
                };
                let uptime = last_spawn
                    .map(|at| format!(" after {}s online", Utc::now().signed_duration_since(at).num_seconds()))
                    .unwrap_or_default();
                self.log(
                    format!("{} disconnected{uptime}", self.identity),
                    MessageKind::Error,
                );
                if config.auto_reconnect {
                    let delay = config.reconnect_delay();
                    self.set_status(BotStatus::Reconnecting).await;
                    self.log(format!("Reconnecting in {delay}ms"), MessageKind::Warning);
                    self.reconnect_at = Some(Instant::now() + Duration::from_millis(delay));
                }
            }
            SessionEvent::Kicked(reason) => {
                let reason = parse_reason(&reason);
                self.log(format!("Kicked: {reason}"), MessageKind::Error);
                self.set_status(BotStatus::Kicked).await;
            }
            SessionEvent::ProtocolError(message) => {
                warn!(identity = %self.identity, message, "protocol error");
                self.log(format!("Error: {message}"), MessageKind::Error);
            }
            SessionEvent::Chat { sender, message } => {
                let flat = flatten(&message);
                if flat.is_blank() {
                    return;
                }
                if self.dedup.is_duplicate(&sender, &flat.plain) {
                    return;
                }
                // The server usually echoes player chat as a system line.
                self.dedup
                    .insert("[Server]", &format!("{}: {}", sender, flat.plain));
                info!(identity = %self.identity, line = %legacy_to_ansi(&flat.display), "chat");
                let api = self.api();
                self.features.on_chat(&api, &flat.plain);
                self.emit(LocalEvent::Chat {
                    sender,
                    message: flat.display,
                    raw: flat.plain,
                    kind: MessageKind::Chat,
                });
            }
            SessionEvent::Whisper { sender, message } => {
                let flat = flatten(&message);
                if flat.is_blank() {
                    return;
                }
                let sender = format!("[WHISPER] {sender}");
                if self.dedup.is_duplicate(&sender, &flat.plain) {
                    return;
                }
                let api = self.api();
                self.features.on_chat(&api, &flat.plain);
                self.emit(LocalEvent::Chat {
                    sender,
                    message: flat.display,
                    raw: flat.plain,
                    kind: MessageKind::Whisper,
                });
            }
            SessionEvent::SystemMessage(payload) => {
                let flat = flatten(&payload);
                if flat.is_blank() {
                    return;
                }
                if self.dedup.is_duplicate("[Server]", &flat.plain) {
                    return;
                }
                info!(identity = %self.identity, line = %legacy_to_ansi(&flat.display), "system");
                let api = self.api();
                self.features.on_chat(&api, &flat.plain);
                self.emit(LocalEvent::Chat {
                    sender: "[Server]".to_string(),
                    message: flat.display,
                    raw: flat.plain,
                    kind: MessageKind::System,
                });
            }
            SessionEvent::PlayerJoined(player) => {
                if player.username != self.identity {
                    self.log(
                        format!("[+] {} joined the game", player.username),
                        MessageKind::Success,
                    );
                }
                if !self.players.iter().any(|p| p.username == player.username) {
                    self.players.push(player);
                }
                self.schedule_players_flush();
            }
            SessionEvent::PlayerLeft(player) => {
                if player.username != self.identity {
                    self.log(
                        format!("[-] {} left the game", player.username),
                        MessageKind::Error,
                    );
                }
                self.players.retain(|p| p.username != player.username);
                self.schedule_players_flush();
            }
            SessionEvent::PlayerList(players) => {
                self.players = players;
                self.schedule_players_flush();
            }
            SessionEvent::InventoryChange(items) => {
                self.pending_inventory = Some(items);
                if self.inventory_flush_at.is_none() {
                    self.inventory_flush_at =
                        Some(Instant::now() + Duration::from_millis(INVENTORY_COALESCE_MS));
                }
            }
            SessionEvent::PositionTick(data) => {
                let api = self.api();
                self.features.on_tick(&api);
                let due = self
                    .last_data_emit
                    .map(|at| at.elapsed() >= Duration::from_millis(DATA_EMIT_INTERVAL_MS))
                    .unwrap_or(true);
                if due {
                    self.last_data_emit = Some(Instant::now());
                    self.shared.lock().await.last_data = Some(data.clone());
                    self.emit(LocalEvent::Data(data));
                }
            }
            SessionEvent::Death => {
                self.log(format!("{} died", self.identity), MessageKind::Warning);
            }
        }
    }

    fn schedule_players_flush(&mut self) {
        if self.players_flush_at.is_none() {
            self.players_flush_at =
                Some(Instant::now() + Duration::from_millis(PLAYER_LIST_COALESCE_MS));
        }
    }

    async fn flush_players(&mut self) {
        self.players_flush_at = None;
        self.shared.lock().await.players = self.players.clone();
        self.emit(LocalEvent::Players(self.players.clone()));
    }

    async fn flush_inventory(&mut self) {
        self.inventory_flush_at = None;
        let Some(items) = self.pending_inventory.take() else {
            return;
        };
        self.shared.lock().await.inventory = items.clone();
        self.emit(LocalEvent::Inventory(items));
    }

    async fn emit_toggles(&mut self) {
        let toggles = {
            let mut shared = self.shared.lock().await;
            let toggles = FeatureToggles {
                killaura: self.features.is_enabled("combat"),
                anti_afk: self.features.is_enabled("antiafk"),
                auto_auth: self.features.is_enabled("autoauth"),
                spammer: self.features.is_enabled("spammer"),
                auto_reconnect: shared.config.auto_reconnect,
            };
            shared.toggles = toggles.clone();
            toggles
        };
        self.emit(LocalEvent::Toggles(toggles));
    }
}

async fn recv_session_event(session: &mut Option<Session>) -> Option<SessionEvent> {
    match session.as_mut() {
        Some(session) => session.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Chat dedup window
// ---------------------------------------------------------------------------

/// Remembers (sender, plain text) fingerprints for a short TTL so the same
/// line arriving over multiple protocol paths produces one history record.
struct DedupWindow {
    entries: HashMap<String, Instant>,
    ttl: Duration,
}

impl DedupWindow {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn is_duplicate(&mut self, sender: &str, plain: &str) -> bool {
        self.prune();
        let key = fingerprint(sender, plain);
        if self.entries.contains_key(&key) {
            true
        } else {
            self.entries.insert(key, Instant::now());
            false
        }
    }

    fn insert(&mut self, sender: &str, plain: &str) {
        self.entries.insert(fingerprint(sender, plain), Instant::now());
    }

    fn prune(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, at| at.elapsed() < ttl);
    }
}

fn fingerprint(sender: &str, plain: &str) -> String {
    format!("{sender}:{plain}")
}

// ---------------------------------------------------------------------------
// Feature lifecycle
// ---------------------------------------------------------------------------

/// Capability surface handed to feature hooks. Session commands are dropped
/// silently while the bot is offline.
struct FeatureApi {
    session: Option<mpsc::UnboundedSender<SessionCommand>>,
    local: mpsc::UnboundedSender<LocalEvent>,
}

impl FeatureApi {
    fn send_chat(&self, message: impl Into<String>) {
        if let Some(session) = &self.session {
            let _ = session.send(SessionCommand::SendChat(message.into()));
        }
    }

    fn set_control(&self, control: &str, state: bool) {
        if let Some(session) = &self.session {
            let _ = session.send(SessionCommand::SetControlState {
                control: control.to_string(),
                state,
            });
        }
    }

    fn look(&self, yaw: f64, pitch: f64) {
        if let Some(session) = &self.session {
            let _ = session.send(SessionCommand::LookAt { yaw, pitch });
        }
    }

    fn swing(&self) {
        if let Some(session) = &self.session {
            let _ = session.send(SessionCommand::Swing);
        }
    }

    fn log(&self, message: impl Into<String>, kind: MessageKind) {
        let _ = self.local.send(LocalEvent::Log {
            message: message.into(),
            kind,
        });
    }

    fn notify(&self, kind: NotificationKind, message: impl Into<String>) {
        let _ = self.local.send(LocalEvent::Notification {
            kind,
            message: message.into(),
        });
    }
}

trait Feature: Send + Sync {
    fn on_init(&mut self, _api: &FeatureApi) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_enable(&mut self, _api: &FeatureApi) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_disable(&mut self, _api: &FeatureApi) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_spawn(&mut self, _api: &FeatureApi) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_tick(&mut self, _api: &FeatureApi) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_chat(&mut self, _api: &FeatureApi, _plain: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_config_update(
        &mut self,
        _api: &FeatureApi,
        _config: &serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_dispose(&mut self, _api: &FeatureApi) -> anyhow::Result<()> {
        Ok(())
    }
}

struct FeatureSlot {
    name: String,
    feature: Box<dyn Feature>,
    enabled: bool,
    faulted: bool,
}

/// Per-bot feature table. A hook returning an error marks its feature
/// faulted: it stays registered but never runs again until the bot restarts,
/// and the fault never propagates to the worker or to other features.
struct FeatureRegistry {
    slots: Vec<FeatureSlot>,
}

impl FeatureRegistry {
    fn new() -> Self {
        Self { slots: Vec::new() }
    }

    fn register(&mut self, name: &str, feature: Box<dyn Feature>, enabled: bool, api: &FeatureApi) {
        if let Some(idx) = self.slots.iter().position(|s| s.name == name) {
            self.run_hook(idx, "dispose", api, |feature, api| feature.on_dispose(api));
            self.slots[idx] = FeatureSlot {
                name: name.to_string(),
                feature,
                enabled,
                faulted: false,
            };
            self.run_hook(idx, "init", api, |feature, api| feature.on_init(api));
        } else {
            self.slots.push(FeatureSlot {
                name: name.to_string(),
                feature,
                enabled,
                faulted: false,
            });
            let idx = self.slots.len() - 1;
            self.run_hook(idx, "init", api, |feature, api| feature.on_init(api));
        }
    }

    fn is_enabled(&self, name: &str) -> bool {
        self.slots
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.enabled && !s.faulted)
            .unwrap_or(false)
    }

    fn enable(&mut self, name: &str, api: &FeatureApi) {
        let Some(idx) = self.slots.iter().position(|s| s.name == name) else {
            return;
        };
        if self.slots[idx].faulted {
            warn!(feature = name, "refusing to enable errored feature");
            api.log(
                format!("Feature '{name}' is in an error state; restart the bot to clear it"),
                MessageKind::Warning,
            );
            return;
        }
        self.slots[idx].enabled = true;
        self.run_hook(idx, "enable", api, |feature, api| feature.on_enable(api));
    }

    fn disable(&mut self, name: &str, api: &FeatureApi) {
        let Some(idx) = self.slots.iter().position(|s| s.name == name) else {
            return;
        };
        self.slots[idx].enabled = false;
        self.run_hook(idx, "disable", api, |feature, api| feature.on_disable(api));
    }

    fn on_spawn(&mut self, api: &FeatureApi) {
        for idx in 0..self.slots.len() {
            if !self.slots[idx].faulted {
                self.run_hook(idx, "spawn", api, |feature, api| feature.on_spawn(api));
            }
        }
    }

    fn on_tick(&mut self, api: &FeatureApi) {
        for idx in 0..self.slots.len() {
            if self.slots[idx].enabled && !self.slots[idx].faulted {
                self.run_hook(idx, "tick", api, |feature, api| feature.on_tick(api));
            }
        }
    }

    fn on_chat(&mut self, api: &FeatureApi, plain: &str) {
        for idx in 0..self.slots.len() {
            if self.slots[idx].enabled && !self.slots[idx].faulted {
                self.run_hook(idx, "chat", api, |feature, api| feature.on_chat(api, plain));
            }
        }
    }

    fn on_config_update(&mut self, name: &str, api: &FeatureApi, config: &serde_json::Value) {
        let Some(idx) = self.slots.iter().position(|s| s.name == name) else {
            return;
        };
        self.run_hook(idx, "config", api, |feature, api| {
            feature.on_config_update(api, config)
        });
    }

    fn run_hook(
        &mut self,
        idx: usize,
        hook: &str,
        api: &FeatureApi,
        invoke: impl FnOnce(&mut dyn Feature, &FeatureApi) -> anyhow::Result<()>,
    ) {
        let slot = &mut self.slots[idx];
        if slot.faulted {
            return;
        }
        if let Err(error) = invoke(slot.feature.as_mut(), api) {
            slot.faulted = true;
            slot.enabled = false;
            warn!(feature = %slot.name, hook, error = %error, "feature hook failed; feature disabled until restart");
            api.log(
                format!("Feature '{}' crashed in {hook}: {error}", slot.name),
                MessageKind::Error,
            );
            api.notify(
                NotificationKind::Error,
                format!("Feature '{}' crashed: {error}", slot.name),
            );
        }
    }
}

const KILLAURA_SWING_TICKS: u64 = 10;
const GAME_TICK_MS: u64 = 50;

#[derive(Default)]
struct CombatFeature {
    ticks: u64,
}

impl Feature for CombatFeature {
    fn on_tick(&mut self, api: &FeatureApi) -> anyhow::Result<()> {
        self.ticks += 1;
        if self.ticks % KILLAURA_SWING_TICKS == 0 {
            api.swing();
        }
        Ok(())
    }
}

struct AntiAfkFeature {
    interval_ticks: u64,
    ticks: u64,
    release_jump: bool,
}

impl AntiAfkFeature {
    fn from_config(config: Option<&AntiAfkConfig>) -> Self {
        let interval = config.map(|c| c.interval).unwrap_or(5000);
        Self {
            interval_ticks: (interval / GAME_TICK_MS).max(1),
            ticks: 0,
            release_jump: false,
        }
    }
}

impl Feature for AntiAfkFeature {
    fn on_tick(&mut self, api: &FeatureApi) -> anyhow::Result<()> {
        if self.release_jump {
            api.set_control("jump", false);
            self.release_jump = false;
        }
        self.ticks += 1;
        if self.ticks % self.interval_ticks != 0 {
            return Ok(());
        }
        let mut rng = rand::rng();
        match rng.random_range(0..3u8) {
            0 => {
                api.set_control("jump", true);
                self.release_jump = true;
            }
            1 => api.look(
                rng.random_range(-3.2..3.2),
                rng.random_range(-1.5..1.5),
            ),
            _ => api.swing(),
        }
        Ok(())
    }
}

struct AutoAuthFeature {
    password: Option<String>,
    register_confirm: bool,
}

impl AutoAuthFeature {
    fn from_config(config: &BotConfig) -> Self {
        Self {
            password: config.password.clone(),
            register_confirm: config
                .auto_auth
                .as_ref()
                .map(|c| c.register_confirm)
                .unwrap_or(true),
        }
    }

    fn authenticate(&self, api: &FeatureApi) -> anyhow::Result<()> {
        let Some(password) = &self.password else {
            return Ok(());
        };
        api.log("Attempting authentication", MessageKind::Info);
        if self.register_confirm {
            api.send_chat(format!("/register {password} {password}"));
        } else {
            api.send_chat(format!("/register {password}"));
        }
        api.send_chat(format!("/login {password}"));
        Ok(())
    }
}

impl Feature for AutoAuthFeature {
    fn on_spawn(&mut self, api: &FeatureApi) -> anyhow::Result<()> {
        self.authenticate(api)
    }

    fn on_chat(&mut self, api: &FeatureApi, plain: &str) -> anyhow::Result<()> {
        let lower = plain.to_lowercase();
        if lower.contains("/register") || lower.contains("/login") {
            self.authenticate(api)?;
        }
        Ok(())
    }
}

struct SpammerFeature {
    config: SpammerConfig,
    next_index: usize,
    last_sent: Option<Instant>,
}

impl SpammerFeature {
    fn new(config: SpammerConfig) -> Self {
        Self {
            config,
            next_index: 0,
            last_sent: None,
        }
    }
}

impl Feature for SpammerFeature {
    fn on_tick(&mut self, api: &FeatureApi) -> anyhow::Result<()> {
        if self.config.messages.is_empty() {
            return Ok(());
        }
        let due = self
            .last_sent
            .map(|at| at.elapsed() >= Duration::from_millis(self.config.delay))
            .unwrap_or(true);
        if !due {
            return Ok(());
        }
        let message = match self.config.order {
            SpamOrder::Sequential => {
                let message = self.config.messages[self.next_index % self.config.messages.len()].clone();
                self.next_index += 1;
                message
            }
            SpamOrder::Random => {
                let mut rng = rand::rng();
                self.config.messages[rng.random_range(0..self.config.messages.len())].clone()
            }
        };
        let message = if self.config.append_random {
            format!("{message} {}", random_suffix(self.config.random_length))
        } else {
            message
        };
        api.send_chat(message);
        self.last_sent = Some(Instant::now());
        Ok(())
    }

    fn on_config_update(
        &mut self,
        _api: &FeatureApi,
        config: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.config = merge_spammer_config(&self.config, config);
        Ok(())
    }
}

fn random_suffix(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .collect()
}

/// Overlays a JSON patch on a spammer config. A `messages` string is split
/// on newlines, matching what the dashboard textarea submits.
fn merge_spammer_config(current: &SpammerConfig, patch: &serde_json::Value) -> SpammerConfig {
    let mut base = serde_json::to_value(current).unwrap_or_default();
    if let (Some(base_map), Some(patch_map)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_map {
            if key == "messages" {
                if let Some(text) = value.as_str() {
                    let lines: Vec<String> = text
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(str::to_string)
                        .collect();
                    base_map.insert(key.clone(), json!(lines));
                    continue;
                }
            }
            base_map.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(base).unwrap_or_else(|_| current.clone())
}

// ---------------------------------------------------------------------------
// Protocol connector seam
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum SessionEvent {
    Spawn,
    Disconnected,
    Kicked(serde_json::Value),
    ProtocolError(String),
    Chat {
        sender: String,
        message: serde_json::Value,
    },
    Whisper {
        sender: String,
        message: serde_json::Value,
    },
    SystemMessage(serde_json::Value),
    PlayerJoined(PlayerInfo),
    PlayerLeft(PlayerInfo),
    PlayerList(Vec<PlayerInfo>),
    InventoryChange(Vec<ItemStack>),
    PositionTick(BotData),
    Death,
}

#[derive(Debug, PartialEq)]
enum SessionCommand {
    SendChat(String),
    SetControlState { control: String, state: bool },
    LookAt { yaw: f64, pitch: f64 },
    Swing,
    UseItem,
    Quit,
}

/// One live protocol session: events in, commands out. Dropping the event
/// sender side is how a connector reports the session ended.
struct Session {
    events: mpsc::Receiver<SessionEvent>,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

#[async_trait]
trait Connector: Send + Sync {
    /// Builds a session for the given config. Fails only when no session can
    /// be constructed at all (e.g. rejected config); transport failures are
    /// reported through the event stream instead.
    async fn connect(&self, config: &BotConfig) -> anyhow::Result<Session>;
}

fn validate_config(config: &BotConfig) -> anyhow::Result<()> {
    if config.username.trim().is_empty() {
        anyhow::bail!("bot username must not be empty");
    }
    if config.host.trim().is_empty() {
        anyhow::bail!("bot host must not be empty");
    }
    if config.port == 0 {
        anyhow::bail!("bot port must not be zero");
    }
    Ok(())
}

/// Newline-delimited JSON over TCP against a protocol bridge process.
struct LineConnector;

#[async_trait]
impl Connector for LineConnector {
    async fn connect(&self, config: &BotConfig) -> anyhow::Result<Session> {
        validate_config(config)?;
        let (events_tx, events_rx) = mpsc::channel(256);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_line_session(
            config.host.clone(),
            config.port,
            config.username.clone(),
            events_tx,
            commands_rx,
        ));
        Ok(Session {
            events: events_rx,
            commands: commands_tx,
        })
    }
}

async fn run_line_session(
    host: String,
    port: u16,
    username: String,
    events: mpsc::Sender<SessionEvent>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(error) => {
            let _ = events
                .send(SessionEvent::ProtocolError(format!(
                    "connect to {host}:{port} failed: {error}"
                )))
                .await;
            let _ = events.send(SessionEvent::Disconnected).await;
            return;
        }
    };

    let (reader, mut writer) = stream.into_split();
    let hello = json!({ "command": "login", "username": username }).to_string();
    if writer
        .write_all(format!("{hello}\n").as_bytes())
        .await
        .is_err()
    {
        let _ = events.send(SessionEvent::Disconnected).await;
        return;
    }

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(event) = decode_frame(&line) {
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        let _ = events
                            .send(SessionEvent::ProtocolError(error.to_string()))
                            .await;
                        break;
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(SessionCommand::Quit) | None => break,
                    Some(command) => {
                        let frame = encode_command(&command);
                        if writer.write_all(format!("{frame}\n").as_bytes()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    let _ = events.send(SessionEvent::Disconnected).await;
}

fn decode_frame(line: &str) -> Option<SessionEvent> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let event = value.get("event")?.as_str()?;
    match event {
        "spawn" => Some(SessionEvent::Spawn),
        "death" => Some(SessionEvent::Death),
        "chat" => Some(SessionEvent::Chat {
            sender: value.get("sender")?.as_str()?.to_string(),
            message: value.get("message").cloned().unwrap_or(serde_json::Value::Null),
        }),
        "whisper" => Some(SessionEvent::Whisper {
            sender: value.get("sender")?.as_str()?.to_string(),
            message: value.get("message").cloned().unwrap_or(serde_json::Value::Null),
        }),
        "system" => Some(SessionEvent::SystemMessage(
            value.get("message").cloned().unwrap_or(serde_json::Value::Null),
        )),
        "kicked" => Some(SessionEvent::Kicked(
            value.get("reason").cloned().unwrap_or(serde_json::Value::Null),
        )),
        "error" => Some(SessionEvent::ProtocolError(
            value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown protocol error")
                .to_string(),
        )),
        "player_joined" => serde_json::from_value(value.get("player")?.clone())
            .ok()
            .map(SessionEvent::PlayerJoined),
        "player_left" => serde_json::from_value(value.get("player")?.clone())
            .ok()
            .map(SessionEvent::PlayerLeft),
        "player_list" => serde_json::from_value(value.get("players")?.clone())
            .ok()
            .map(SessionEvent::PlayerList),
        "inventory" => serde_json::from_value(value.get("items")?.clone())
            .ok()
            .map(SessionEvent::InventoryChange),
        "position" => serde_json::from_value(value.get("data")?.clone())
            .ok()
            .map(SessionEvent::PositionTick),
        _ => None,
    }
}

fn encode_command(command: &SessionCommand) -> String {
    match command {
        SessionCommand::SendChat(message) => json!({ "command": "chat", "message": message }),
        SessionCommand::SetControlState { control, state } => {
            json!({ "command": "control", "control": control, "state": state })
        }
        SessionCommand::LookAt { yaw, pitch } => {
            json!({ "command": "look", "yaw": yaw, "pitch": pitch })
        }
        SessionCommand::Swing => json!({ "command": "swing" }),
        SessionCommand::UseItem => json!({ "command": "use" }),
        SessionCommand::Quit => json!({ "command": "quit" }),
    }
    .to_string()
}

// ---------------------------------------------------------------------------
// Config store
// ---------------------------------------------------------------------------

/// JSON file persistence for bot configs and dashboard settings. Writes are
/// merge-on-save so concurrent bots never clobber each other's entries.
struct ConfigStore {
    bots_path: PathBuf,
    settings_path: PathBuf,
    guard: Mutex<()>,
}

impl ConfigStore {
    fn new(data_dir: &Path) -> Self {
        Self {
            bots_path: data_dir.join("bots.json"),
            settings_path: data_dir.join("settings.json"),
            guard: Mutex::new(()),
        }
    }

    async fn load_bots(&self) -> anyhow::Result<Vec<BotConfig>> {
        let _guard = self.guard.lock().await;
        read_bots(&self.bots_path)
    }

    async fn save_bot(&self, config: &BotConfig) -> anyhow::Result<()> {
        let _guard = self.guard.lock().await;
        let mut bots = read_bots(&self.bots_path)?;
        match bots.iter_mut().find(|b| b.username == config.username) {
            Some(existing) => *existing = config.clone(),
            None => bots.push(config.clone()),
        }
        write_json(&self.bots_path, &serde_json::to_value(&bots)?)
    }

    async fn remove_bot(&self, username: &str) -> anyhow::Result<()> {
        let _guard = self.guard.lock().await;
        let mut bots = read_bots(&self.bots_path)?;
        bots.retain(|b| b.username != username);
        write_json(&self.bots_path, &serde_json::to_value(&bots)?)
    }

    async fn load_settings(&self) -> serde_json::Value {
        let _guard = self.guard.lock().await;
        read_settings(&self.settings_path)
    }

    async fn save_settings(&self, patch: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let _guard = self.guard.lock().await;
        let mut settings = read_settings(&self.settings_path);
        if let (Some(base), Some(patch)) = (settings.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                base.insert(key.clone(), value.clone());
            }
        }
        write_json(&self.settings_path, &settings)?;
        Ok(settings)
    }
}

fn read_bots(path: &Path) -> anyhow::Result<Vec<BotConfig>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(error) => Err(error).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn read_settings(path: &Path) -> serde_json::Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_else(|| json!({}))
}

fn write_json(path: &Path, value: &serde_json::Value) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(value)?;
    std::fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use botdeck_common::AuthMode;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{advance, timeout};

    struct StubSession {
        events: mpsc::Sender<SessionEvent>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    }

    struct StubConnector {
        sessions: mpsc::UnboundedSender<StubSession>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Connector for StubConnector {
        async fn connect(&self, _config: &BotConfig) -> anyhow::Result<Session> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("no session transport available");
            }
            let (events_tx, events_rx) = mpsc::channel(64);
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            let _ = self.sessions.send(StubSession {
                events: events_tx,
                commands: commands_rx,
            });
            Ok(Session {
                events: events_rx,
                commands: commands_tx,
            })
        }
    }

    fn temp_data_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("botdeck-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn stub_registry() -> (
        Arc<BotRegistry>,
        mpsc::UnboundedReceiver<StubSession>,
        Arc<StubConnector>,
    ) {
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(StubConnector {
            sessions: sessions_tx,
            fail: AtomicBool::new(false),
        });
        let registry = BotRegistry::new(ConfigStore::new(&temp_data_dir()), connector.clone());
        (registry, sessions_rx, connector)
    }

    fn test_config(username: &str) -> BotConfig {
        BotConfig {
            username: username.to_string(),
            host: "localhost".to_string(),
            port: 25565,
            password: None,
            auth: AuthMode::Offline,
            version: None,
            auto_reconnect: true,
            reconnect_delay_ms: Some(2000),
            spammer: None,
            anti_afk: None,
            auto_auth: None,
        }
    }

    async fn expect_session(sessions: &mut mpsc::UnboundedReceiver<StubSession>) -> StubSession {
        timeout(Duration::from_secs(60), sessions.recv())
            .await
            .expect("timed out waiting for a session")
            .expect("connector dropped")
    }

    async fn wait_for_status(bus: &mut broadcast::Receiver<ServerEvent>, wanted: BotStatus) {
        loop {
            let event = timeout(Duration::from_secs(60), bus.recv())
                .await
                .expect("timed out waiting for status")
                .expect("event bus closed");
            if let ServerEvent::BotStatus { status, .. } = event {
                if status == wanted {
                    return;
                }
            }
        }
    }

    async fn wait_for_chat(bus: &mut broadcast::Receiver<ServerEvent>, wanted: &str) {
        loop {
            let event = timeout(Duration::from_secs(60), bus.recv())
                .await
                .expect("timed out waiting for chat")
                .expect("event bus closed");
            if let ServerEvent::BotChat { message, .. } = event {
                if message == wanted {
                    return;
                }
            }
        }
    }

    fn record(i: usize) -> MessageRecord {
        MessageRecord {
            sender: "tester".to_string(),
            message: format!("{i}"),
            raw_text: format!("{i}"),
            kind: MessageKind::Chat,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn history_is_bounded_fifo() {
        let mut history = VecDeque::new();
        for i in 0..105 {
            push_record(&mut history, record(i));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.front().unwrap().message, "5");
        assert_eq!(history.back().unwrap().message, "104");
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_window_expires_entries() {
        let mut window = DedupWindow::new(Duration::from_millis(DEDUP_WINDOW_MS));
        assert!(!window.is_duplicate("bob", "hello"));
        assert!(window.is_duplicate("bob", "hello"));
        assert!(!window.is_duplicate("eve", "hello"));
        advance(Duration::from_secs(1)).await;
        assert!(!window.is_duplicate("bob", "hello"));
    }

    struct FailingFeature {
        ticks: u64,
    }

    impl Feature for FailingFeature {
        fn on_tick(&mut self, _api: &FeatureApi) -> anyhow::Result<()> {
            self.ticks += 1;
            anyhow::bail!("boom");
        }
    }

    struct CountingFeature {
        ticks: Arc<AtomicUsize>,
    }

    impl Feature for CountingFeature {
        fn on_tick(&mut self, _api: &FeatureApi) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn feature_fault_is_sticky_and_isolated() {
        let (local_tx, mut local_rx) = mpsc::unbounded_channel();
        let api = FeatureApi {
            session: None,
            local: local_tx,
        };
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut features = FeatureRegistry::new();
        features.register("bad", Box::new(FailingFeature { ticks: 0 }), true, &api);
        features.register(
            "good",
            Box::new(CountingFeature {
                ticks: Arc::clone(&ticks),
            }),
            true,
            &api,
        );

        features.on_tick(&api);
        features.on_tick(&api);

        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(!features.is_enabled("bad"));
        assert!(features.is_enabled("good"));

        // The fault is sticky: enabling again is refused.
        features.enable("bad", &api);
        assert!(!features.is_enabled("bad"));

        let mut notifications = 0;
        while let Ok(event) = local_rx.try_recv() {
            if matches!(event, LocalEvent::Notification { .. }) {
                notifications += 1;
            }
        }
        assert_eq!(notifications, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spammer_respects_delay_and_sequence() {
        let (local_tx, _local_rx) = mpsc::unbounded_channel();
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let api = FeatureApi {
            session: Some(session_tx),
            local: local_tx,
        };
        let mut spammer = SpammerFeature::new(SpammerConfig {
            enabled: true,
            delay: 1000,
            messages: vec!["one".to_string(), "two".to_string()],
            order: SpamOrder::Sequential,
            append_random: false,
            random_length: 5,
        });

        spammer.on_tick(&api).unwrap();
        assert_eq!(
            session_rx.try_recv().unwrap(),
            SessionCommand::SendChat("one".to_string())
        );
        spammer.on_tick(&api).unwrap();
        assert!(session_rx.try_recv().is_err());

        advance(Duration::from_millis(1100)).await;
        spammer.on_tick(&api).unwrap();
        assert_eq!(
            session_rx.try_recv().unwrap(),
            SessionCommand::SendChat("two".to_string())
        );
    }

    #[test]
    fn spammer_config_merge_splits_message_lines() {
        let merged = merge_spammer_config(
            &SpammerConfig::default(),
            &json!({ "messages": "first\n\nsecond\n", "delay": 250 }),
        );
        assert_eq!(merged.messages, vec!["first", "second"]);
        assert_eq!(merged.delay, 250);
        assert_eq!(merged.random_length, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_schedules_single_reconnect() {
        let (registry, mut sessions, _connector) = stub_registry();
        let mut bus = registry.subscribe();
        registry.create(test_config("alice"), false).await.unwrap();
        registry
            .command("alice", BotCommand::Connect)
            .await
            .unwrap();
        let first = expect_session(&mut sessions).await;
        wait_for_status(&mut bus, BotStatus::Connecting).await;

        first.events.send(SessionEvent::Disconnected).await.unwrap();
        wait_for_status(&mut bus, BotStatus::Offline).await;
        wait_for_status(&mut bus, BotStatus::Reconnecting).await;

        let _second = expect_session(&mut sessions).await;
        wait_for_status(&mut bus, BotStatus::Connecting).await;

        // One disconnect, one timer, one new session.
        assert!(timeout(Duration::from_secs(30), sessions.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect_and_is_idempotent() {
        let (registry, mut sessions, _connector) = stub_registry();
        let mut bus = registry.subscribe();
        registry.create(test_config("alice"), false).await.unwrap();
        registry
            .command("alice", BotCommand::Connect)
            .await
            .unwrap();
        let first = expect_session(&mut sessions).await;
        wait_for_status(&mut bus, BotStatus::Connecting).await;

        first.events.send(SessionEvent::Disconnected).await.unwrap();
        wait_for_status(&mut bus, BotStatus::Reconnecting).await;

        registry.command("alice", BotCommand::Stop).await.unwrap();
        wait_for_status(&mut bus, BotStatus::Stopped).await;
        registry.command("alice", BotCommand::Stop).await.unwrap();

        // The dangling timer must not produce a session.
        assert!(timeout(Duration::from_secs(30), sessions.recv())
            .await
            .is_err());

        // And the second stop must not broadcast a second Stopped.
        loop {
            match timeout(Duration::from_secs(5), bus.recv()).await {
                Ok(Ok(ServerEvent::BotStatus { status, .. })) => {
                    assert_ne!(status, BotStatus::Stopped)
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_replaces_pending_reconnect_delay() {
        let (registry, mut sessions, _connector) = stub_registry();
        let mut bus = registry.subscribe();
        let mut config = test_config("alice");
        config.reconnect_delay_ms = Some(5000);
        registry.create(config, false).await.unwrap();
        registry
            .command("alice", BotCommand::Connect)
            .await
            .unwrap();
        let first = expect_session(&mut sessions).await;
        wait_for_status(&mut bus, BotStatus::Connecting).await;

        first.events.send(SessionEvent::Disconnected).await.unwrap();
        wait_for_status(&mut bus, BotStatus::Reconnecting).await;

        let started = Instant::now();
        registry.command("alice", BotCommand::Rejoin).await.unwrap();
        let _second = expect_session(&mut sessions).await;
        // The fixed rejoin delay wins over the pending 5s backoff.
        assert!(started.elapsed() < Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_session_construction_is_fatal_without_retry() {
        let (registry, mut sessions, connector) = stub_registry();
        let mut bus = registry.subscribe();
        connector.fail.store(true, Ordering::SeqCst);
        registry.create(test_config("alice"), false).await.unwrap();
        registry
            .command("alice", BotCommand::Connect)
            .await
            .unwrap();
        wait_for_status(&mut bus, BotStatus::FatalError).await;
        assert!(timeout(Duration::from_secs(30), sessions.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn chat_dedup_suppresses_echo_and_repeats() {
        let (registry, mut sessions, _connector) = stub_registry();
        let mut bus = registry.subscribe();
        registry.create(test_config("alice"), false).await.unwrap();
        registry
            .command("alice", BotCommand::Connect)
            .await
            .unwrap();
        let session = expect_session(&mut sessions).await;
        wait_for_status(&mut bus, BotStatus::Connecting).await;

        session
            .events
            .send(SessionEvent::Chat {
                sender: "bob".to_string(),
                message: json!("hi"),
            })
            .await
            .unwrap();
        wait_for_chat(&mut bus, "hi").await;

        // Server echo of the same line and a straight repeat, both inside
        // the dedup window.
        session
            .events
            .send(SessionEvent::SystemMessage(json!("bob: hi")))
            .await
            .unwrap();
        session
            .events
            .send(SessionEvent::Chat {
                sender: "bob".to_string(),
                message: json!("hi"),
            })
            .await
            .unwrap();
        session
            .events
            .send(SessionEvent::Chat {
                sender: "bob".to_string(),
                message: json!("done"),
            })
            .await
            .unwrap();
        wait_for_chat(&mut bus, "done").await;

        let snapshot = registry.snapshot("alice").await.unwrap();
        let chat_lines: Vec<&MessageRecord> = snapshot
            .history
            .iter()
            .filter(|r| r.kind == MessageKind::Chat)
            .collect();
        assert_eq!(chat_lines.len(), 2);
        assert_eq!(chat_lines[0].raw_text, "hi");
        assert_eq!(chat_lines[1].raw_text, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn chat_broadcast_reaches_every_viewer() {
        let (registry, mut sessions, _connector) = stub_registry();
        let mut bus_a = registry.subscribe();
        let mut bus_b = registry.subscribe();
        registry.create(test_config("alice"), false).await.unwrap();
        registry
            .command("alice", BotCommand::Connect)
            .await
            .unwrap();
        let mut session = expect_session(&mut sessions).await;

        let result =
            dispatch_action(&registry, "alice", BotAction::Chat, json!({ "message": "hello" }))
                .await;
        assert!(result.is_none());

        let command = timeout(Duration::from_secs(60), session.commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(command, SessionCommand::SendChat("hello".to_string()));

        session
            .events
            .send(SessionEvent::Chat {
                sender: "alice".to_string(),
                message: json!("hello"),
            })
            .await
            .unwrap();
        wait_for_chat(&mut bus_a, "hello").await;
        wait_for_chat(&mut bus_b, "hello").await;
    }

    #[tokio::test]
    async fn duplicate_create_and_unknown_update_are_rejected() {
        let (registry, _sessions, _connector) = stub_registry();
        registry.create(test_config("alice"), false).await.unwrap();
        let error = registry
            .create(test_config("alice"), false)
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::DuplicateIdentity(_)));

        let error = registry.update(test_config("ghost")).await.unwrap_err();
        assert!(matches!(error, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (registry, _sessions, _connector) = stub_registry();
        registry.create(test_config("alice"), true).await.unwrap();
        registry.remove("alice").await.unwrap();
        registry.remove("alice").await.unwrap();
        assert!(registry.list_all().await.is_empty());
        assert!(registry.store.load_bots().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn kick_reason_is_parsed_into_history() {
        let (registry, mut sessions, _connector) = stub_registry();
        let mut bus = registry.subscribe();
        registry.create(test_config("alice"), false).await.unwrap();
        registry
            .command("alice", BotCommand::Connect)
            .await
            .unwrap();
        let session = expect_session(&mut sessions).await;
        wait_for_status(&mut bus, BotStatus::Connecting).await;

        session
            .events
            .send(SessionEvent::Kicked(
                json!({ "text": "Banned", "extra": [{ "text": " forever" }] }),
            ))
            .await
            .unwrap();
        wait_for_status(&mut bus, BotStatus::Kicked).await;

        let snapshot = registry.snapshot("alice").await.unwrap();
        assert!(snapshot
            .history
            .iter()
            .any(|r| r.raw_text.contains("Banned forever")));
    }

    #[tokio::test(start_paused = true)]
    async fn toggles_and_spammer_config_are_broadcast() {
        let (registry, _sessions, _connector) = stub_registry();
        let mut bus = registry.subscribe();
        registry.create(test_config("alice"), true).await.unwrap();

        let result = dispatch_action(
            &registry,
            "alice",
            BotAction::ToggleKillaura,
            json!({ "enabled": true }),
        )
        .await;
        assert!(result.is_none());
        loop {
            let event = timeout(Duration::from_secs(60), bus.recv())
                .await
                .unwrap()
                .unwrap();
            if let ServerEvent::BotToggles { toggles, .. } = event {
                if toggles.killaura {
                    break;
                }
            }
        }

        let result = dispatch_action(
            &registry,
            "alice",
            BotAction::ToggleSpammer,
            json!({ "enabled": true, "config": { "messages": "a\nb", "delay": 100 } }),
        )
        .await;
        assert!(result.is_none());
        loop {
            let event = timeout(Duration::from_secs(60), bus.recv())
                .await
                .unwrap()
                .unwrap();
            if let ServerEvent::SpammerConfig { config, .. } = event {
                assert!(config.enabled);
                assert_eq!(config.messages, vec!["a", "b"]);
                assert_eq!(config.delay, 100);
                break;
            }
        }

        // The merged config is persisted with the bot.
        let saved = registry.store.load_bots().await.unwrap();
        let spammer = saved[0].spammer.clone().unwrap();
        assert_eq!(spammer.messages, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_applies_config_without_reconnecting() {
        let (registry, mut sessions, _connector) = stub_registry();
        let mut bus = registry.subscribe();
        registry.create(test_config("alice"), false).await.unwrap();
        registry
            .command("alice", BotCommand::Connect)
            .await
            .unwrap();
        let _session = expect_session(&mut sessions).await;
        wait_for_status(&mut bus, BotStatus::Connecting).await;

        let mut config = test_config("alice");
        config.host = "other.example".to_string();
        registry.update(config).await.unwrap();
        loop {
            let event = timeout(Duration::from_secs(60), bus.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, ServerEvent::BotToggles { .. }) {
                break;
            }
        }

        let snapshot = registry.snapshot("alice").await.unwrap();
        assert_eq!(snapshot.config.host, "other.example");
        assert!(timeout(Duration::from_secs(30), sessions.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn action_on_unknown_bot_notifies_error() {
        let (registry, _sessions, _connector) = stub_registry();
        let event = dispatch_action(&registry, "ghost", BotAction::Rejoin, json!({})).await;
        assert!(matches!(
            event,
            Some(ServerEvent::Notification {
                kind: NotificationKind::Error,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn config_store_round_trip() {
        let store = ConfigStore::new(&temp_data_dir());
        store.save_bot(&test_config("alice")).await.unwrap();
        let mut edited = test_config("alice");
        edited.port = 1234;
        store.save_bot(&edited).await.unwrap();
        store.save_bot(&test_config("bob")).await.unwrap();

        let bots = store.load_bots().await.unwrap();
        assert_eq!(bots.len(), 2);
        assert_eq!(
            bots.iter().find(|b| b.username == "alice").unwrap().port,
            1234
        );

        store.remove_bot("alice").await.unwrap();
        assert_eq!(store.load_bots().await.unwrap().len(), 1);

        store.save_settings(json!({ "theme": "dark" })).await.unwrap();
        let merged = store.save_settings(json!({ "port": 3001 })).await.unwrap();
        assert_eq!(merged["theme"], "dark");
        assert_eq!(merged["port"], 3001);
        assert_eq!(store.load_settings().await, merged);
    }

    #[test]
    fn line_frames_decode_and_commands_encode() {
        let event = decode_frame(r#"{"event":"chat","sender":"bob","message":{"text":"hi"}}"#);
        assert!(matches!(
            event,
            Some(SessionEvent::Chat { ref sender, .. }) if sender.as_str() == "bob"
        ));

        let event = decode_frame(r#"{"event":"player_list","players":[{"username":"bob"}]}"#);
        assert!(matches!(
            event,
            Some(SessionEvent::PlayerList(ref players)) if players.len() == 1
        ));

        assert!(decode_frame(r#"{"event":"warp_drive"}"#).is_none());
        assert!(decode_frame("not json").is_none());

        let frame = encode_command(&SessionCommand::SendChat("hi".to_string()));
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["command"], "chat");
        assert_eq!(value["message"], "hi");
    }

    #[test]
    fn config_validation_rejects_bad_endpoints() {
        assert!(validate_config(&test_config("alice")).is_ok());

        let mut config = test_config("");
        assert!(validate_config(&config).is_err());

        config = test_config("alice");
        config.port = 0;
        assert!(validate_config(&config).is_err());

        config = test_config("alice");
        config.host = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }
}
