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

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Bounded per-bot chat/log history capacity (FIFO eviction).
pub const HISTORY_CAPACITY: usize = 100;
/// How long a message fingerprint stays in the dedup window.
pub const DEDUP_WINDOW_MS: u64 = 750;
/// Minimum auto-reconnect delay; configured delays below this are clamped.
pub const RECONNECT_FLOOR_MS: u64 = 1000;
/// Fixed delay used by a manual rejoin, overriding the configured delay.
pub const REJOIN_DELAY_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
/// Position/health updates are emitted at most this often.
pub const DATA_EMIT_INTERVAL_MS: u64 = 500;
/// Player join/leave bursts are coalesced into one list emission.
pub const PLAYER_LIST_COALESCE_MS: u64 = 500;
/// Inventory slot-update bursts are coalesced into one snapshot emission.
pub const INVENTORY_COALESCE_MS: u64 = 100;

pub type BotIdentity = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStatus {
    Created,
    Connecting,
    Online,
    Offline,
    Kicked,
    Reconnecting,
    FatalError,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    Offline,
    Online,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    Whisper,
    System,
    Info,
    Warning,
    Error,
    Success,
}

/// One canonical chat/log line in a bot's bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub sender: String,
    /// Display form, formatting codes retained.
    pub message: String,
    /// Plain form with formatting stripped, used for dedup and search.
    #[serde(rename = "rawText")]
    pub raw_text: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotData {
    pub position: Position,
    pub health: f64,
    pub food: f64,
    pub yaw: f64,
    pub pitch: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerInfo {
    pub username: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub ping: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemStack {
    pub slot: u16,
    pub name: String,
    pub display_name: String,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpamOrder {
    Sequential,
    #[default]
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SpammerConfig {
    pub enabled: bool,
    /// Delay between messages, in milliseconds.
    pub delay: u64,
    pub messages: Vec<String>,
    pub order: SpamOrder,
    pub append_random: bool,
    pub random_length: usize,
}

impl Default for SpammerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: 3000,
            messages: Vec::new(),
            order: SpamOrder::default(),
            append_random: false,
            random_length: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AntiAfkConfig {
    pub enabled: bool,
    /// Interval between anti-AFK actions, in milliseconds.
    pub interval: u64,
}

impl Default for AntiAfkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoAuthConfig {
    pub enabled: bool,
    /// Whether /register expects the password twice.
    pub register_confirm: bool,
}

impl Default for AutoAuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            register_confirm: true,
        }
    }
}

/// Connection parameters and per-feature settings for one managed bot.
///
/// Exactly one config exists per identity (the username); the registry
/// persists it on every create/update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    pub username: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auth: AuthMode,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub reconnect_delay_ms: Option<u64>,
    #[serde(default)]
    pub spammer: Option<SpammerConfig>,
    #[serde(default)]
    pub anti_afk: Option<AntiAfkConfig>,
    #[serde(default)]
    pub auto_auth: Option<AutoAuthConfig>,
}

fn default_true() -> bool {
    true
}

impl BotConfig {
    /// Effective auto-reconnect delay, clamped to the minimum floor.
    pub fn reconnect_delay(&self) -> u64 {
        self.reconnect_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS)
            .max(RECONNECT_FLOOR_MS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureToggles {
    pub killaura: bool,
    pub anti_afk: bool,
    pub auto_auth: bool,
    pub spammer: bool,
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Success,
    Error,
    Info,
    Warning,
}

/// Registry snapshot entry used to hydrate new viewer sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSummary {
    pub username: BotIdentity,
    pub status: BotStatus,
    pub host: String,
    pub port: u16,
    pub config: BotConfig,
}

/// Server-to-viewer push events. Every event carries the identity it refers
/// to; the server broadcasts to all viewers and clients filter by selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    Settings {
        settings: serde_json::Value,
    },
    BotList {
        bots: Vec<BotSummary>,
    },
    BotStatus {
        username: BotIdentity,
        status: BotStatus,
    },
    BotData {
        username: BotIdentity,
        data: BotData,
    },
    BotChat {
        username: BotIdentity,
        sender: String,
        message: String,
        #[serde(rename = "messageType")]
        kind: MessageKind,
    },
    BotLog {
        username: BotIdentity,
        message: String,
        #[serde(rename = "messageType")]
        kind: MessageKind,
    },
    BotInventory {
        username: BotIdentity,
        items: Vec<ItemStack>,
    },
    BotPlayers {
        username: BotIdentity,
        players: Vec<PlayerInfo>,
    },
    ChatHistory {
        username: BotIdentity,
        history: Vec<MessageRecord>,
    },
    BotToggles {
        username: BotIdentity,
        toggles: FeatureToggles,
    },
    SpammerConfig {
        username: BotIdentity,
        config: SpammerConfig,
    },
    BotRemoved {
        username: BotIdentity,
    },
    Notification {
        #[serde(rename = "notificationType")]
        kind: NotificationKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BotAction {
    Chat,
    Move,
    ToggleKillaura,
    ToggleSpammer,
    #[serde(rename = "toggleAntiAFK")]
    ToggleAntiAfk,
    ToggleAutoAuth,
    ToggleAutoReconnect,
    Rejoin,
    SetLook,
    Suicide,
    Stop,
    Delete,
    Click,
    ToggleView,
}

/// Viewer-to-server commands arriving over the websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewerCommand {
    CreateBot {
        config: BotConfig,
    },
    EditBot {
        config: BotConfig,
    },
    BotAction {
        username: BotIdentity,
        action: BotAction,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Control {
        username: BotIdentity,
        control: String,
        state: bool,
    },
    SelectBot {
        username: BotIdentity,
    },
    SaveSettings {
        settings: serde_json::Value,
    },
}

/// A rich-text chat payload as the upstream protocol ships it: plain
/// strings, bare arrays, or objects with nested `text`/`translate`/`extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatComponent {
    Text(String),
    Number(f64),
    Bool(bool),
    List(Vec<ChatComponent>),
    Object(ChatObject),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatObject {
    #[serde(default)]
    pub text: Option<Box<ChatComponent>>,
    #[serde(default)]
    pub translate: Option<String>,
    #[serde(default, rename = "with")]
    pub with_args: Option<Vec<ChatComponent>>,
    #[serde(default)]
    pub extra: Option<Vec<ChatComponent>>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// Canonical form of a normalized upstream message: the display string keeps
/// legacy `§` formatting codes, the plain string has them stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatText {
    pub display: String,
    pub plain: String,
}

impl FlatText {
    pub fn is_blank(&self) -> bool {
        self.plain.trim().is_empty()
    }
}

/// Flatten any upstream chat payload into its canonical form.
pub fn flatten(payload: &serde_json::Value) -> FlatText {
    let display = match serde_json::from_value::<ChatComponent>(payload.clone()) {
        Ok(component) => flatten_component(&component),
        Err(_) => payload.to_string(),
    };
    let plain = strip_format_codes(&display);
    FlatText { display, plain }
}

fn flatten_component(component: &ChatComponent) -> String {
    let mut out = String::new();
    append_component(component, &mut out);
    out
}

fn append_component(component: &ChatComponent, out: &mut String) {
    match component {
        ChatComponent::Text(text) => out.push_str(text),
        ChatComponent::Number(value) => out.push_str(&value.to_string()),
        ChatComponent::Bool(value) => out.push_str(if *value { "true" } else { "false" }),
        ChatComponent::List(items) => {
            for item in items {
                append_component(item, out);
            }
        }
        ChatComponent::Object(object) => append_object(object, out),
    }
}

fn append_object(object: &ChatObject, out: &mut String) {
    if let Some(code) = object.color.as_deref().and_then(color_to_code) {
        out.push('§');
        out.push(code);
    }

    let before = out.len();

    if let Some(text) = object.text.as_deref() {
        append_component(text, out);
    }

    if let Some(translate) = object.translate.as_deref() {
        out.push_str(translate);
        if let Some(args) = object.with_args.as_deref() {
            let rendered: Vec<String> = args
                .iter()
                .map(flatten_component)
                .filter(|arg| !arg.is_empty())
                .collect();
            if !rendered.is_empty() {
                out.push(' ');
                out.push_str(&rendered.join(" "));
            }
        }
    }

    if let Some(extra) = object.extra.as_deref() {
        for item in extra {
            append_component(item, out);
        }
    }

    // Structured NBT-ish payloads sometimes carry only a bare value.
    if out.len() == before
        && let Some(value) = object.value.as_ref()
    {
        match value {
            serde_json::Value::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
    }
}

fn color_to_code(name: &str) -> Option<char> {
    match name {
        "black" => Some('0'),
        "dark_blue" => Some('1'),
        "dark_green" => Some('2'),
        "dark_aqua" => Some('3'),
        "dark_red" => Some('4'),
        "dark_purple" => Some('5'),
        "gold" => Some('6'),
        "gray" => Some('7'),
        "dark_gray" => Some('8'),
        "blue" => Some('9'),
        "green" => Some('a'),
        "aqua" => Some('b'),
        "red" => Some('c'),
        "light_purple" => Some('d'),
        "yellow" => Some('e'),
        "white" => Some('f'),
        _ => None,
    }
}

/// Best-effort human-readable kick/error reason. Never fails: a payload that
/// cannot be rendered at all yields a fixed placeholder string.
pub fn parse_reason(reason: &serde_json::Value) -> String {
    match reason {
        serde_json::Value::Null => "Unknown reason".to_string(),
        serde_json::Value::String(text) => text.clone(),
        other => {
            let flat = flatten(other);
            if !flat.is_blank() {
                return flat.display;
            }
            serde_json::to_string(other)
                .unwrap_or_else(|_| "Unable to parse kick reason".to_string())
        }
    }
}

/// Remove legacy `§x` formatting codes.
pub fn strip_format_codes(text: &str) -> String {
    let re = Regex::new(r"§[0-9a-fk-or]").unwrap();
    re.replace_all(text, "").into_owned()
}

/// Convert legacy `§x` formatting codes to ANSI escapes for console output.
/// A trailing reset avoids bleeding styles into subsequent lines.
pub fn legacy_to_ansi(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let re = Regex::new(r"§([0-9a-fk-or])").unwrap();
    let converted = re.replace_all(text, |caps: &regex::Captures| {
        match &caps[1] {
            "0" => "\x1b[30m",
            "1" => "\x1b[34m",
            "2" => "\x1b[32m",
            "3" => "\x1b[36m",
            "4" => "\x1b[31m",
            "5" => "\x1b[35m",
            "6" => "\x1b[33m",
            "7" => "\x1b[37m",
            "8" => "\x1b[90m",
            "9" => "\x1b[94m",
            "a" => "\x1b[92m",
            "b" => "\x1b[96m",
            "c" => "\x1b[91m",
            "d" => "\x1b[95m",
            "e" => "\x1b[93m",
            "f" => "\x1b[97m",
            "l" => "\x1b[1m",
            "m" => "\x1b[9m",
            "n" => "\x1b[4m",
            "o" => "\x1b[3m",
            _ => "\x1b[0m",
        }
        .to_string()
    });

    format!("{converted}\x1b[0m")
}
