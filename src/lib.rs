//! INDI protocol client
//!
//! Implements the client side of the INDI (Instrument Neutral Distributed
//! Interface) wire protocol, version 1.7, for controlling astronomical
//! instruments such as mounts, cameras, focusers, and filter wheels over a
//! persistent TCP stream.
//!
//! ## Features
//!
//! - In-memory mirror of the server's device/property catalog
//! - Typed decoding of the rootless concatenated-XML message stream
//! - Blocking set operations that resolve on the server's Ok/Alert transition
//! - BLOB persistence to a pluggable filesystem plus live stream fan-out
//! - Pluggable transport dialer (TCP by default, in-memory for tests)
//!
//! An INDI server is under no obligation to answer a command it does not
//! understand, and usually won't. Every outbound command is therefore
//! validated against the local catalog before it is queued, so a caller gets
//! an error instead of silence when something doesn't look right.

mod blob;
mod catalog;
mod client;
mod error;
mod message;
mod transport;
mod wire;

pub use blob::{BlobSink, BlobStream};
pub use catalog::{
    BlobValue, BlobVector, Catalog, Device, LightValue, LightVector, MessageEntry, NumberValue,
    NumberVector, PropertyVector, SwitchValue, SwitchVector, TextValue, TextVector,
};
pub use client::IndiClient;
pub use error::{IndiError, IndiResult};
pub use message::{
    BlobItem, BlobPayload, Command, DefVector, DelProperty, DeviceMessage, LightItem, NumberItem,
    ServerMessage, SetVector, SwitchItem, TextItem,
};
pub use transport::{BlobStorage, Connection, Dialer, LocalStorage, TcpDialer};
pub use wire::{encode, MessageReader};

use serde::Serialize;

/// Default INDI server port.
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// Protocol version sent with `getProperties`.
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// Current state of a property: Idle (gray), Ok (green), Busy (yellow), or
/// Alert (red).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropertyState {
    Idle,
    Ok,
    Busy,
    Alert,
}

impl PropertyState {
    /// Parse a wire state attribute. Unknown values default to Idle.
    pub fn parse(s: &str) -> Self {
        match s {
            "Ok" => PropertyState::Ok,
            "Busy" => PropertyState::Busy,
            "Alert" => PropertyState::Alert,
            _ => PropertyState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyState::Idle => "Idle",
            PropertyState::Ok => "Ok",
            PropertyState::Busy => "Busy",
            PropertyState::Alert => "Alert",
        }
    }
}

/// State of a switch value: "On" or "Off".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchState {
    Off,
    On,
}

impl SwitchState {
    /// Parse a wire switch value. Anything other than "On" is Off.
    pub fn parse(s: &str) -> Self {
        if s == "On" {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchState::On => "On",
            SwitchState::Off => "Off",
        }
    }
}

/// How switch values in a vector relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchRule {
    /// Exactly one switch in the vector is active at a time.
    OneOfMany,
    /// No more than one switch in the vector is active at a time.
    AtMostOne,
    /// Any number of switches in the vector may be active.
    AnyOfMany,
}

impl SwitchRule {
    /// Parse a wire rule attribute. Unknown values default to OneOfMany.
    pub fn parse(s: &str) -> Self {
        match s {
            "AtMostOne" => SwitchRule::AtMostOne,
            "AnyOfMany" => SwitchRule::AnyOfMany,
            _ => SwitchRule::OneOfMany,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchRule::OneOfMany => "OneOfMany",
            SwitchRule::AtMostOne => "AtMostOne",
            SwitchRule::AnyOfMany => "AnyOfMany",
        }
    }
}

/// Permission hint for a property: read-only, write-only, or read-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropertyPermission {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl PropertyPermission {
    /// Parse a wire perm attribute. Unknown values default to read-write.
    pub fn parse(s: &str) -> Self {
        match s {
            "ro" => PropertyPermission::ReadOnly,
            "wo" => PropertyPermission::WriteOnly,
            _ => PropertyPermission::ReadWrite,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyPermission::ReadOnly => "ro",
            PropertyPermission::WriteOnly => "wo",
            PropertyPermission::ReadWrite => "rw",
        }
    }
}

/// Whether the server should send BLOBs to this connection.
///
/// BLOBs are not sent by default. It is common to enable them on a dedicated
/// connection and keep the main connection clear of large transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlobEnable {
    /// Never send BLOBs for the device (the server default).
    Never,
    /// Send BLOBs in addition to the normal INDI traffic.
    Also,
    /// Send only BLOBs for the device.
    Only,
}

impl BlobEnable {
    pub fn parse(s: &str) -> IndiResult<Self> {
        match s {
            "Never" => Ok(BlobEnable::Never),
            "Also" => Ok(BlobEnable::Also),
            "Only" => Ok(BlobEnable::Only),
            other => Err(IndiError::InvalidBlobEnable(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlobEnable::Never => "Never",
            BlobEnable::Also => "Also",
            BlobEnable::Only => "Only",
        }
    }
}

/// The five property kinds a device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropertyKind {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

/// Tunable knobs for a client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Capacity of the inbound and outbound message queues.
    pub channel_capacity: usize,
    /// How long a set operation waits for the server to resolve the property
    /// to Ok or Alert before giving up (default: 30 seconds).
    pub set_timeout_secs: u64,
    /// Interval between catalog polls while a set operation waits for its
    /// resolution (default: 50 ms).
    pub poll_interval_ms: u64,
    /// Per-subscriber buffered BLOB chunk count. A subscriber whose buffer is
    /// full when a BLOB arrives is dropped rather than stalling the sink.
    pub stream_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            set_timeout_secs: 30,
            poll_interval_ms: 50,
            stream_buffer: 16,
        }
    }
}

impl ClientConfig {
    pub fn set_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.set_timeout_secs)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}
