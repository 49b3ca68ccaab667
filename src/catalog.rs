//! In-memory mirror of the server's device/property catalog.
//!
//! Devices hold five independent kind-indexed property maps. All reads and
//! mutations go through one reader-writer lock owned by [`Catalog`]; the
//! dispatcher applies inbound messages under the exclusive lock, facade
//! readers take the shared lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::blob::BlobSink;
use crate::error::{IndiError, IndiResult};
use crate::message::{
    BlobItem, DefVector, DelProperty, DeviceMessage, LightItem, NumberItem, ServerMessage,
    SetVector, SwitchItem, TextItem,
};
use crate::{PropertyKind, PropertyPermission, PropertyState, SwitchRule, SwitchState};

/// One entry in a device or property message log.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A text value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TextValue {
    pub label: String,
    pub name: String,
    pub value: String,
}

/// A number value. The value is kept as the string the server sent so its
/// precision survives; format, min, max, and step come from the definition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NumberValue {
    pub label: String,
    pub name: String,
    pub value: String,
    pub format: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// A switch value.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchValue {
    pub label: String,
    pub name: String,
    pub value: SwitchState,
}

/// A light value.
#[derive(Debug, Clone, Serialize)]
pub struct LightValue {
    pub label: String,
    pub name: String,
    pub value: PropertyState,
}

/// A BLOB value. `path` and `size` are transient: the sink arms them when a
/// payload is persisted and [`Catalog::take_blob`] resets them, so each
/// received artifact can be read at most once.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BlobValue {
    pub label: String,
    pub name: String,
    pub path: String,
    pub format: String,
    pub size: u64,
}

impl BlobValue {
    /// An armed BLOB has bytes on disk waiting to be consumed.
    pub fn armed(&self) -> bool {
        self.size > 0 && !self.path.is_empty()
    }
}

/// A property: common attributes plus a mapping from value name to value.
#[derive(Debug, Clone, Serialize)]
pub struct PropertyVector<V> {
    pub name: String,
    pub label: String,
    pub group: String,
    pub perm: PropertyPermission,
    /// Only switch vectors carry a rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<SwitchRule>,
    pub state: PropertyState,
    pub timeout: f64,
    pub last_updated: DateTime<Utc>,
    pub messages: Vec<MessageEntry>,
    pub values: HashMap<String, V>,
}

pub type TextVector = PropertyVector<TextValue>;
pub type NumberVector = PropertyVector<NumberValue>;
pub type SwitchVector = PropertyVector<SwitchValue>;
pub type LightVector = PropertyVector<LightValue>;
pub type BlobVector = PropertyVector<BlobValue>;

/// A device: five kind-indexed property maps and a message log.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub name: String,
    pub texts: HashMap<String, TextVector>,
    pub numbers: HashMap<String, NumberVector>,
    pub switches: HashMap<String, SwitchVector>,
    pub lights: HashMap<String, LightVector>,
    pub blobs: HashMap<String, BlobVector>,
    pub messages: Vec<MessageEntry>,
}

impl Device {
    fn new(name: String) -> Self {
        Self {
            name,
            texts: HashMap::new(),
            numbers: HashMap::new(),
            switches: HashMap::new(),
            lights: HashMap::new(),
            blobs: HashMap::new(),
            messages: Vec::new(),
        }
    }

    /// A property name lives in exactly one kind map; a definition under a
    /// new kind evicts it from the others.
    fn remove_property_except(&mut self, name: &str, keep: PropertyKind) {
        if keep != PropertyKind::Text {
            self.texts.remove(name);
        }
        if keep != PropertyKind::Number {
            self.numbers.remove(name);
        }
        if keep != PropertyKind::Switch {
            self.switches.remove(name);
        }
        if keep != PropertyKind::Light {
            self.lights.remove(name);
        }
        if keep != PropertyKind::Blob {
            self.blobs.remove(name);
        }
    }

    fn remove_property(&mut self, name: &str) {
        self.texts.remove(name);
        self.numbers.remove(name);
        self.switches.remove(name);
        self.lights.remove(name);
        self.blobs.remove(name);
    }
}

/// Glue between a value type and its message items and kind map.
pub(crate) trait CatalogValue: Sized + Clone {
    type Item;
    const KIND: PropertyKind;

    fn item_name(item: &Self::Item) -> &str;
    fn define(item: &Self::Item) -> Self;
    fn update(&mut self, item: &Self::Item);
    fn map(device: &mut Device) -> &mut HashMap<String, PropertyVector<Self>>;
    fn map_ref(device: &Device) -> &HashMap<String, PropertyVector<Self>>;
    /// Lights are inherently read-only regardless of the wire attribute.
    fn effective_perm(perm: PropertyPermission) -> PropertyPermission {
        perm
    }
}

impl CatalogValue for TextValue {
    type Item = TextItem;
    const KIND: PropertyKind = PropertyKind::Text;

    fn item_name(item: &TextItem) -> &str {
        &item.name
    }

    fn define(item: &TextItem) -> Self {
        Self {
            label: item.label.clone(),
            name: item.name.clone(),
            value: item.value.clone(),
        }
    }

    fn update(&mut self, item: &TextItem) {
        self.value = item.value.clone();
    }

    fn map(device: &mut Device) -> &mut HashMap<String, TextVector> {
        &mut device.texts
    }

    fn map_ref(device: &Device) -> &HashMap<String, TextVector> {
        &device.texts
    }
}

impl CatalogValue for NumberValue {
    type Item = NumberItem;
    const KIND: PropertyKind = PropertyKind::Number;

    fn item_name(item: &NumberItem) -> &str {
        &item.name
    }

    fn define(item: &NumberItem) -> Self {
        Self {
            label: item.label.clone(),
            name: item.name.clone(),
            value: item.value.clone(),
            format: item.format.clone(),
            min: item.min,
            max: item.max,
            step: item.step,
        }
    }

    fn update(&mut self, item: &NumberItem) {
        self.value = item.value.clone();
    }

    fn map(device: &mut Device) -> &mut HashMap<String, NumberVector> {
        &mut device.numbers
    }

    fn map_ref(device: &Device) -> &HashMap<String, NumberVector> {
        &device.numbers
    }
}

impl CatalogValue for SwitchValue {
    type Item = SwitchItem;
    const KIND: PropertyKind = PropertyKind::Switch;

    fn item_name(item: &SwitchItem) -> &str {
        &item.name
    }

    fn define(item: &SwitchItem) -> Self {
        Self {
            label: item.label.clone(),
            name: item.name.clone(),
            value: item.value,
        }
    }

    fn update(&mut self, item: &SwitchItem) {
        self.value = item.value;
    }

    fn map(device: &mut Device) -> &mut HashMap<String, SwitchVector> {
        &mut device.switches
    }

    fn map_ref(device: &Device) -> &HashMap<String, SwitchVector> {
        &device.switches
    }
}

impl CatalogValue for LightValue {
    type Item = LightItem;
    const KIND: PropertyKind = PropertyKind::Light;

    fn item_name(item: &LightItem) -> &str {
        &item.name
    }

    fn define(item: &LightItem) -> Self {
        Self {
            label: item.label.clone(),
            name: item.name.clone(),
            value: item.value,
        }
    }

    fn update(&mut self, item: &LightItem) {
        self.value = item.value;
    }

    fn map(device: &mut Device) -> &mut HashMap<String, LightVector> {
        &mut device.lights
    }

    fn map_ref(device: &Device) -> &HashMap<String, LightVector> {
        &device.lights
    }

    fn effective_perm(_perm: PropertyPermission) -> PropertyPermission {
        PropertyPermission::ReadOnly
    }
}

impl CatalogValue for BlobValue {
    type Item = BlobItem;
    const KIND: PropertyKind = PropertyKind::Blob;

    fn item_name(item: &BlobItem) -> &str {
        &item.name
    }

    /// Definitions always produce an empty BLOB value.
    fn define(item: &BlobItem) -> Self {
        Self {
            label: item.label.clone(),
            name: item.name.clone(),
            ..Self::default()
        }
    }

    fn update(&mut self, item: &BlobItem) {
        self.format = item.format.clone();
    }

    fn map(device: &mut Device) -> &mut HashMap<String, BlobVector> {
        &mut device.blobs
    }

    fn map_ref(device: &Device) -> &HashMap<String, BlobVector> {
        &device.blobs
    }
}

/// The catalog. Owns the device map and the lock discipline over it.
#[derive(Default)]
pub struct Catalog {
    devices: RwLock<HashMap<String, Device>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one inbound message. Mutations run under the exclusive lock and
    /// in call order, so later messages observe earlier ones.
    pub async fn apply(&self, msg: ServerMessage, sink: &BlobSink) {
        let mut devices = self.devices.write().await;
        match msg {
            ServerMessage::DefText(def) => define::<TextValue>(&mut devices, def),
            ServerMessage::DefNumber(def) => define::<NumberValue>(&mut devices, def),
            ServerMessage::DefSwitch(def) => define::<SwitchValue>(&mut devices, def),
            ServerMessage::DefLight(def) => define::<LightValue>(&mut devices, def),
            ServerMessage::DefBlob(def) => define::<BlobValue>(&mut devices, def),
            ServerMessage::SetText(set) => update::<TextValue>(&mut devices, set),
            ServerMessage::SetNumber(set) => {
                if !set.message.is_empty() {
                    tracing::debug!(device = %set.device, property = %set.name, message = %set.message, "number update message");
                }
                update::<NumberValue>(&mut devices, set);
            }
            ServerMessage::SetSwitch(set) => update::<SwitchValue>(&mut devices, set),
            ServerMessage::SetLight(set) => update::<LightValue>(&mut devices, set),
            ServerMessage::SetBlob(set) => update_blob(&mut devices, set, sink).await,
            ServerMessage::Message(msg) => append_device_message(&mut devices, msg),
            ServerMessage::DelProperty(del) => delete(&mut devices, del),
        }
    }

    /// Drop every device. Used on connect, disconnect, and purge-all
    /// deletions.
    pub async fn purge(&self) {
        self.devices.write().await.clear();
    }

    /// Snapshot of the known device names.
    pub async fn device_names(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    /// Snapshot of one device, if known.
    pub async fn device(&self, name: &str) -> Option<Device> {
        self.devices.read().await.get(name).cloned()
    }

    pub async fn get_text(&self, device: &str, property: &str, value: &str) -> IndiResult<TextValue> {
        self.get_value::<TextValue>(device, property, value).await
    }

    pub async fn get_number(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<NumberValue> {
        self.get_value::<NumberValue>(device, property, value).await
    }

    pub async fn get_switch(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<SwitchValue> {
        self.get_value::<SwitchValue>(device, property, value).await
    }

    pub async fn get_light(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<LightValue> {
        self.get_value::<LightValue>(device, property, value).await
    }

    async fn get_value<V: CatalogValue>(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<V> {
        let devices = self.devices.read().await;
        let dev = devices
            .get(device)
            .ok_or_else(|| IndiError::DeviceNotFound(device.to_string()))?;
        let prop = V::map_ref(dev)
            .get(property)
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: device.to_string(),
                property: property.to_string(),
            })?;
        prop.values
            .get(value)
            .cloned()
            .ok_or_else(|| IndiError::PropertyValueNotFound {
                device: device.to_string(),
                property: property.to_string(),
                value: value.to_string(),
            })
    }

    /// Existence probe for a property of the given kind.
    pub async fn has_property(&self, kind: PropertyKind, device: &str, property: &str) -> bool {
        let devices = self.devices.read().await;
        let Some(dev) = devices.get(device) else {
            return false;
        };
        match kind {
            PropertyKind::Text => dev.texts.contains_key(property),
            PropertyKind::Number => dev.numbers.contains_key(property),
            PropertyKind::Switch => dev.switches.contains_key(property),
            PropertyKind::Light => dev.lights.contains_key(property),
            PropertyKind::Blob => dev.blobs.contains_key(property),
        }
    }

    pub async fn has_device(&self, device: &str) -> bool {
        self.devices.read().await.contains_key(device)
    }

    /// Current state of a property, for resolution polling.
    pub async fn property_state(
        &self,
        kind: PropertyKind,
        device: &str,
        property: &str,
    ) -> IndiResult<PropertyState> {
        let devices = self.devices.read().await;
        let dev = devices
            .get(device)
            .ok_or_else(|| IndiError::DeviceNotFound(device.to_string()))?;
        let state = match kind {
            PropertyKind::Text => dev.texts.get(property).map(|p| p.state),
            PropertyKind::Number => dev.numbers.get(property).map(|p| p.state),
            PropertyKind::Switch => dev.switches.get(property).map(|p| p.state),
            PropertyKind::Light => dev.lights.get(property).map(|p| p.state),
            PropertyKind::Blob => dev.blobs.get(property).map(|p| p.state),
        };
        state.ok_or_else(|| IndiError::PropertyNotFound {
            device: device.to_string(),
            property: property.to_string(),
        })
    }

    pub async fn begin_set_text(
        &self,
        device: &str,
        property: &str,
        names: &[&str],
    ) -> IndiResult<()> {
        self.begin_set::<TextValue>(device, property, names).await
    }

    pub async fn begin_set_number(
        &self,
        device: &str,
        property: &str,
        names: &[&str],
    ) -> IndiResult<()> {
        self.begin_set::<NumberValue>(device, property, names).await
    }

    pub async fn begin_set_switch(
        &self,
        device: &str,
        property: &str,
        names: &[&str],
    ) -> IndiResult<()> {
        self.begin_set::<SwitchValue>(device, property, names).await
    }

    pub async fn begin_set_blob(
        &self,
        device: &str,
        property: &str,
        names: &[&str],
    ) -> IndiResult<()> {
        self.begin_set::<BlobValue>(device, property, names).await
    }

    /// Validate a consumer set request and mark the property Busy.
    ///
    /// Rejects unknown devices, unknown properties, read-only properties,
    /// properties whose previous change has not resolved, and unknown value
    /// names. Nothing is mutated on rejection.
    async fn begin_set<V: CatalogValue>(
        &self,
        device: &str,
        property: &str,
        names: &[&str],
    ) -> IndiResult<()> {
        let mut devices = self.devices.write().await;
        let dev = devices
            .get_mut(device)
            .ok_or_else(|| IndiError::DeviceNotFound(device.to_string()))?;
        let prop = V::map(dev)
            .get_mut(property)
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: device.to_string(),
                property: property.to_string(),
            })?;
        if prop.state == PropertyState::Busy {
            return Err(IndiError::PropertyBusy {
                device: device.to_string(),
                property: property.to_string(),
            });
        }
        if prop.perm == PropertyPermission::ReadOnly {
            return Err(IndiError::PropertyReadOnly {
                device: device.to_string(),
                property: property.to_string(),
            });
        }
        for name in names {
            if !prop.values.contains_key(*name) {
                return Err(IndiError::PropertyValueNotFound {
                    device: device.to_string(),
                    property: property.to_string(),
                    value: (*name).to_string(),
                });
            }
        }
        prop.state = PropertyState::Busy;
        Ok(())
    }

    /// Non-destructive check whether a BLOB value is armed.
    pub async fn blob_available(&self, device: &str, property: &str, value: &str) -> bool {
        self.get_value::<BlobValue>(device, property, value)
            .await
            .map(|v| v.armed())
            .unwrap_or(false)
    }

    /// Consume an armed BLOB: open its file for reading and return the
    /// handle, the stored path, and the byte length, then reset the value so
    /// the same artifact cannot be read twice. Opening happens under the
    /// exclusive lock so a concurrent sink write cannot race the read; if the
    /// open fails the value stays armed.
    pub async fn take_blob(
        &self,
        storage: &dyn crate::transport::BlobStorage,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<(Box<dyn tokio::io::AsyncRead + Send + Unpin>, String, u64)> {
        let mut devices = self.devices.write().await;
        let dev = devices
            .get_mut(device)
            .ok_or_else(|| IndiError::DeviceNotFound(device.to_string()))?;
        let prop = dev
            .blobs
            .get_mut(property)
            .ok_or_else(|| IndiError::PropertyNotFound {
                device: device.to_string(),
                property: property.to_string(),
            })?;
        let val = prop
            .values
            .get_mut(value)
            .ok_or_else(|| IndiError::PropertyValueNotFound {
                device: device.to_string(),
                property: property.to_string(),
                value: value.to_string(),
            })?;
        if !val.armed() {
            return Err(IndiError::BlobNotFound {
                device: device.to_string(),
                property: property.to_string(),
                value: value.to_string(),
            });
        }
        let reader = storage.open(&val.path).await?;
        let out = (reader, val.path.clone(), val.size);
        val.path.clear();
        val.size = 0;
        Ok(out)
    }

    /// Validate that a BLOB value exists, for stream subscription.
    pub async fn ensure_blob_value(
        &self,
        device: &str,
        property: &str,
        value: &str,
    ) -> IndiResult<()> {
        self.get_value::<BlobValue>(device, property, value)
            .await
            .map(|_| ())
    }
}

fn define<V: CatalogValue>(devices: &mut HashMap<String, Device>, def: DefVector<V::Item>) {
    let device = devices
        .entry(def.device.clone())
        .or_insert_with(|| Device::new(def.device.clone()));
    device.remove_property_except(&def.name, V::KIND);

    let mut values = HashMap::new();
    for item in &def.items {
        values.insert(V::item_name(item).to_string(), V::define(item));
    }

    let mut messages = Vec::new();
    if !def.message.is_empty() {
        messages.push(MessageEntry {
            message: def.message.clone(),
            timestamp: def.timestamp,
        });
    }

    V::map(device).insert(
        def.name.clone(),
        PropertyVector {
            name: def.name,
            label: def.label,
            group: def.group,
            perm: V::effective_perm(def.perm),
            rule: def.rule,
            state: def.state,
            timeout: def.timeout,
            last_updated: Utc::now(),
            messages,
            values,
        },
    );
}

fn update<V: CatalogValue>(devices: &mut HashMap<String, Device>, set: SetVector<V::Item>) {
    let Some(device) = devices.get_mut(&set.device) else {
        tracing::warn!(device = %set.device, "could not find device");
        return;
    };
    let Some(prop) = V::map(device).get_mut(&set.name) else {
        tracing::warn!(device = %set.device, property = %set.name, "could not find property");
        return;
    };

    prop.state = set.state;
    prop.timeout = set.timeout;
    prop.last_updated = set.timestamp;

    for item in &set.items {
        // Servers may send sparse updates; names missing from the definition
        // are ignored, and a set never introduces new values.
        if let Some(value) = prop.values.get_mut(V::item_name(item)) {
            value.update(item);
        }
    }

    if !set.message.is_empty() {
        prop.messages.push(MessageEntry {
            message: set.message.clone(),
            timestamp: set.timestamp,
        });
    }
}

/// The BLOB variant of the set mutator: besides the usual header update,
/// every matched value drives the sink's decode-persist-fan-out pipeline.
async fn update_blob(
    devices: &mut HashMap<String, Device>,
    set: SetVector<BlobItem>,
    sink: &BlobSink,
) {
    let Some(device) = devices.get_mut(&set.device) else {
        tracing::warn!(device = %set.device, "could not find device");
        return;
    };
    let Some(prop) = device.blobs.get_mut(&set.name) else {
        tracing::warn!(device = %set.device, property = %set.name, "could not find property");
        return;
    };

    prop.state = set.state;
    prop.timeout = set.timeout;
    prop.last_updated = set.timestamp;

    for item in &set.items {
        let Some(value) = prop.values.get_mut(&item.name) else {
            continue;
        };
        match sink.store(&set.device, &set.name, item).await {
            Ok((path, written)) => {
                value.path = path;
                value.size = written;
                value.format = item.format.clone();
            }
            Err(error) => {
                tracing::warn!(
                    device = %set.device,
                    property = %set.name,
                    value = %item.name,
                    %error,
                    "could not store blob"
                );
            }
        }
    }

    if !set.message.is_empty() {
        prop.messages.push(MessageEntry {
            message: set.message.clone(),
            timestamp: set.timestamp,
        });
    }
}

fn append_device_message(devices: &mut HashMap<String, Device>, msg: DeviceMessage) {
    let Some(device) = devices.get_mut(&msg.device) else {
        tracing::warn!(device = %msg.device, "could not find device");
        return;
    };
    device.messages.push(MessageEntry {
        message: msg.message,
        timestamp: msg.timestamp,
    });
}

fn delete(devices: &mut HashMap<String, Device>, del: DelProperty) {
    if del.device.is_empty() {
        devices.clear();
        return;
    }
    if del.name.is_empty() {
        devices.remove(&del.device);
        return;
    }
    if let Some(device) = devices.get_mut(&del.device) {
        device.remove_property(&del.name);
    }
}
