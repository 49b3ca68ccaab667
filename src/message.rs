//! Typed protocol messages.
//!
//! The inbound stream decodes into [`ServerMessage`], a tagged variant with
//! one case per INDI element; the dispatcher is a total match over it.
//! Outbound commands are [`Command`] values serialized by the wire codec.

use chrono::{DateTime, Utc};

use crate::{BlobEnable, PropertyPermission, PropertyState, SwitchRule, SwitchState};

/// Child of a text vector (`defText` / `oneText`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextItem {
    pub name: String,
    pub label: String,
    pub value: String,
}

/// Child of a number vector (`defNumber` / `oneNumber`).
///
/// The value is kept as the server sent it so no precision is lost; format,
/// min, max, and step only appear on definitions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NumberItem {
    pub name: String,
    pub label: String,
    pub value: String,
    pub format: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// Child of a switch vector (`defSwitch` / `oneSwitch`).
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchItem {
    pub name: String,
    pub label: String,
    pub value: SwitchState,
}

/// Child of a light vector (`defLight` / `oneLight`).
#[derive(Debug, Clone, PartialEq)]
pub struct LightItem {
    pub name: String,
    pub label: String,
    pub value: PropertyState,
}

/// Child of a BLOB vector (`defBLOB` / `oneBLOB`).
///
/// On a set message the value is the whitespace-trimmed base64 payload; on a
/// definition it is empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobItem {
    pub name: String,
    pub label: String,
    pub value: String,
    pub format: String,
    pub size: u64,
}

/// A property definition (`def*Vector`).
#[derive(Debug, Clone)]
pub struct DefVector<I> {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    pub state: PropertyState,
    pub perm: PropertyPermission,
    /// Only present on switch vectors.
    pub rule: Option<SwitchRule>,
    pub timeout: f64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub items: Vec<I>,
}

/// A property update (`set*Vector`).
#[derive(Debug, Clone)]
pub struct SetVector<I> {
    pub device: String,
    pub name: String,
    pub state: PropertyState,
    pub timeout: f64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub items: Vec<I>,
}

/// A free-form device-level notification (`message`).
#[derive(Debug, Clone)]
pub struct DeviceMessage {
    pub device: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A deletion (`delProperty`). Empty device purges everything; empty name
/// purges the whole device; otherwise a single property is purged.
#[derive(Debug, Clone)]
pub struct DelProperty {
    pub device: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

/// Every message the server can originate, one case per element.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    DefText(DefVector<TextItem>),
    DefNumber(DefVector<NumberItem>),
    DefSwitch(DefVector<SwitchItem>),
    DefLight(DefVector<LightItem>),
    DefBlob(DefVector<BlobItem>),
    SetText(SetVector<TextItem>),
    SetNumber(SetVector<NumberItem>),
    SetSwitch(SetVector<SwitchItem>),
    SetLight(SetVector<LightItem>),
    SetBlob(SetVector<BlobItem>),
    Message(DeviceMessage),
    DelProperty(DelProperty),
}

impl ServerMessage {
    /// Element name, for logging.
    pub fn element(&self) -> &'static str {
        match self {
            ServerMessage::DefText(_) => "defTextVector",
            ServerMessage::DefNumber(_) => "defNumberVector",
            ServerMessage::DefSwitch(_) => "defSwitchVector",
            ServerMessage::DefLight(_) => "defLightVector",
            ServerMessage::DefBlob(_) => "defBLOBVector",
            ServerMessage::SetText(_) => "setTextVector",
            ServerMessage::SetNumber(_) => "setNumberVector",
            ServerMessage::SetSwitch(_) => "setSwitchVector",
            ServerMessage::SetLight(_) => "setLightVector",
            ServerMessage::SetBlob(_) => "setBLOBVector",
            ServerMessage::Message(_) => "message",
            ServerMessage::DelProperty(_) => "delProperty",
        }
    }
}

/// A BLOB payload submitted by the consumer for a `newBLOBVector`.
#[derive(Debug, Clone)]
pub struct BlobPayload {
    pub name: String,
    pub format: String,
    pub data: bytes::Bytes,
}

/// Every command the client can emit.
#[derive(Debug, Clone)]
pub enum Command {
    /// `getProperties`; empty device requests the full catalog.
    GetProperties { device: String, name: String },
    /// `enableBLOB` with the mode as element text.
    EnableBlob {
        device: String,
        name: String,
        mode: BlobEnable,
    },
    /// `newTextVector` with (name, value) children.
    NewText {
        device: String,
        name: String,
        items: Vec<(String, String)>,
    },
    /// `newNumberVector`; values are strings to preserve caller precision.
    NewNumber {
        device: String,
        name: String,
        items: Vec<(String, String)>,
    },
    /// `newSwitchVector` with (name, state) children.
    NewSwitch {
        device: String,
        name: String,
        items: Vec<(String, SwitchState)>,
    },
    /// `newBLOBVector` carrying a single base64-encoded payload.
    NewBlob {
        device: String,
        name: String,
        blob: BlobPayload,
    },
}

impl Command {
    /// Element name, for logging.
    pub fn element(&self) -> &'static str {
        match self {
            Command::GetProperties { .. } => "getProperties",
            Command::EnableBlob { .. } => "enableBLOB",
            Command::NewText { .. } => "newTextVector",
            Command::NewNumber { .. } => "newNumberVector",
            Command::NewSwitch { .. } => "newSwitchVector",
            Command::NewBlob { .. } => "newBLOBVector",
        }
    }
}
