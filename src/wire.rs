//! Wire codec for the INDI XML stream.
//!
//! Inbound traffic is a sequence of top-level elements appearing back-to-back
//! with no surrounding root. [`MessageReader`] treats each top-level
//! start-element as an independent message boundary and decodes the complete
//! element, children included, into a [`ServerMessage`]. Outbound
//! [`Command`]s are serialized by [`encode`].

use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::Writer;
use tokio::io::{AsyncRead, BufReader};

use crate::error::{IndiError, IndiResult};
use crate::message::{
    BlobItem, Command, DefVector, DelProperty, DeviceMessage, LightItem, NumberItem, ServerMessage,
    SetVector, SwitchItem, TextItem,
};
use crate::{PropertyPermission, PropertyState, SwitchRule, SwitchState, INDI_PROTOCOL_VERSION};

/// Wire timestamp layout: `YYYY-MM-DDTHH:MM:SS.f`, UTC, fraction optional.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Parse a protocol timestamp. Missing timestamps substitute the wall clock
/// silently; unparseable ones substitute the wall clock with a warning.
pub(crate) fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    match raw {
        None => Utc::now(),
        Some(s) if s.is_empty() => Utc::now(),
        Some(s) => match NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT) {
            Ok(naive) => naive.and_utc(),
            Err(error) => {
                tracing::warn!(timestamp = %s, %error, "could not parse timestamp");
                Utc::now()
            }
        },
    }
}

fn codec_err(e: quick_xml::Error) -> IndiError {
    match e {
        quick_xml::Error::Io(io) => {
            IndiError::Stream(std::io::Error::new(io.kind(), io.to_string()))
        }
        other => IndiError::Parse(other.to_string()),
    }
}

/// Owned copy of one element's attributes plus its text content.
#[derive(Debug, Default)]
struct RawElement {
    attrs: Vec<(String, String)>,
    text: String,
}

impl RawElement {
    fn from_start(e: &BytesStart) -> Self {
        let mut attrs = Vec::new();
        for attr in e.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
            attrs.push((key, value));
        }
        Self {
            attrs,
            text: String::new(),
        }
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn attr_string(&self, name: &str) -> String {
        self.attr(name).unwrap_or_default().to_string()
    }

    fn attr_f64(&self, name: &str) -> f64 {
        self.attr(name).and_then(|v| v.parse().ok()).unwrap_or(0.0)
    }

    fn attr_u64(&self, name: &str) -> u64 {
        self.attr(name).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    fn trimmed_text(&self) -> String {
        self.text.trim().to_string()
    }
}

fn text_item(c: RawElement) -> TextItem {
    TextItem {
        name: c.attr_string("name"),
        label: c.attr_string("label"),
        value: c.trimmed_text(),
    }
}

fn number_item(c: RawElement) -> NumberItem {
    NumberItem {
        name: c.attr_string("name"),
        label: c.attr_string("label"),
        value: c.trimmed_text(),
        format: c.attr_string("format"),
        min: c.attr_f64("min"),
        max: c.attr_f64("max"),
        step: c.attr_f64("step"),
    }
}

fn switch_item(c: RawElement) -> SwitchItem {
    SwitchItem {
        name: c.attr_string("name"),
        label: c.attr_string("label"),
        value: SwitchState::parse(c.text.trim()),
    }
}

fn light_item(c: RawElement) -> LightItem {
    LightItem {
        name: c.attr_string("name"),
        label: c.attr_string("label"),
        value: PropertyState::parse(c.text.trim()),
    }
}

fn blob_item(c: RawElement) -> BlobItem {
    BlobItem {
        name: c.attr_string("name"),
        label: c.attr_string("label"),
        format: c.attr_string("format"),
        size: c.attr_u64("size"),
        value: c.trimmed_text(),
    }
}

fn def_vector<I>(head: &RawElement, items: Vec<I>) -> DefVector<I> {
    DefVector {
        device: head.attr_string("device"),
        name: head.attr_string("name"),
        label: head.attr_string("label"),
        group: head.attr_string("group"),
        state: PropertyState::parse(head.attr("state").unwrap_or("Idle")),
        perm: PropertyPermission::parse(head.attr("perm").unwrap_or("rw")),
        rule: head.attr("rule").map(SwitchRule::parse),
        timeout: head.attr_f64("timeout"),
        timestamp: parse_timestamp(head.attr("timestamp")),
        message: head.attr_string("message"),
        items,
    }
}

fn set_vector<I>(head: &RawElement, items: Vec<I>) -> SetVector<I> {
    SetVector {
        device: head.attr_string("device"),
        name: head.attr_string("name"),
        state: PropertyState::parse(head.attr("state").unwrap_or("Idle")),
        timeout: head.attr_f64("timeout"),
        timestamp: parse_timestamp(head.attr("timestamp")),
        message: head.attr_string("message"),
        items,
    }
}

/// Decoder over the inbound byte stream.
///
/// `next` yields one decoded message at a time. A parse failure is returned
/// as [`IndiError::Parse`] and the decoder can be called again to resume at
/// the next token; an I/O failure is [`IndiError::Stream`] and is terminal.
pub struct MessageReader<R> {
    reader: quick_xml::Reader<BufReader<R>>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        let mut reader = quick_xml::Reader::from_reader(BufReader::new(inner));
        reader.trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Decode the next top-level element. Returns `Ok(None)` at end of
    /// stream.
    pub async fn next(&mut self) -> IndiResult<Option<ServerMessage>> {
        loop {
            self.buf.clear();
            match self.reader.read_event_into_async(&mut self.buf).await {
                Ok(Event::Start(e)) => {
                    let name = e.name().as_ref().to_vec();
                    let head = RawElement::from_start(&e);
                    match name.as_slice() {
                        b"message" => {
                            self.skip_to_end(&name).await?;
                            return Ok(Some(message_from(&head)));
                        }
                        b"delProperty" => {
                            self.skip_to_end(&name).await?;
                            return Ok(Some(del_property_from(&head)));
                        }
                        _ => {
                            if let Some(msg) = self.decode_vector(&name, &head).await? {
                                return Ok(Some(msg));
                            }
                            tracing::warn!(
                                element = %String::from_utf8_lossy(&name),
                                "unknown element"
                            );
                            self.skip_to_end(&name).await?;
                        }
                    }
                }
                Ok(Event::Empty(e)) => {
                    let name = e.name().as_ref().to_vec();
                    let head = RawElement::from_start(&e);
                    match name.as_slice() {
                        b"message" => return Ok(Some(message_from(&head))),
                        b"delProperty" => return Ok(Some(del_property_from(&head))),
                        _ => {
                            // A childless vector is well-formed, just empty.
                            if let Some(msg) = self.decode_empty_vector(&name, &head) {
                                return Ok(Some(msg));
                            }
                            tracing::warn!(
                                element = %String::from_utf8_lossy(&name),
                                "unknown element"
                            );
                        }
                    }
                }
                Ok(Event::Eof) => return Ok(None),
                Ok(_) => {}
                Err(e) => return Err(codec_err(e)),
            }
        }
    }

    async fn decode_vector(
        &mut self,
        name: &[u8],
        head: &RawElement,
    ) -> IndiResult<Option<ServerMessage>> {
        let msg = match name {
            b"defTextVector" => ServerMessage::DefText(def_vector(
                head,
                self.read_children(name).await?.into_iter().map(text_item).collect(),
            )),
            b"defNumberVector" => ServerMessage::DefNumber(def_vector(
                head,
                self.read_children(name).await?.into_iter().map(number_item).collect(),
            )),
            b"defSwitchVector" => ServerMessage::DefSwitch(def_vector(
                head,
                self.read_children(name).await?.into_iter().map(switch_item).collect(),
            )),
            b"defLightVector" => ServerMessage::DefLight(def_vector(
                head,
                self.read_children(name).await?.into_iter().map(light_item).collect(),
            )),
            b"defBLOBVector" => ServerMessage::DefBlob(def_vector(
                head,
                self.read_children(name).await?.into_iter().map(blob_item).collect(),
            )),
            b"setTextVector" => ServerMessage::SetText(set_vector(
                head,
                self.read_children(name).await?.into_iter().map(text_item).collect(),
            )),
            b"setNumberVector" => ServerMessage::SetNumber(set_vector(
                head,
                self.read_children(name).await?.into_iter().map(number_item).collect(),
            )),
            b"setSwitchVector" => ServerMessage::SetSwitch(set_vector(
                head,
                self.read_children(name).await?.into_iter().map(switch_item).collect(),
            )),
            b"setLightVector" => ServerMessage::SetLight(set_vector(
                head,
                self.read_children(name).await?.into_iter().map(light_item).collect(),
            )),
            b"setBLOBVector" => ServerMessage::SetBlob(set_vector(
                head,
                self.read_children(name).await?.into_iter().map(blob_item).collect(),
            )),
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    fn decode_empty_vector(&self, name: &[u8], head: &RawElement) -> Option<ServerMessage> {
        let msg = match name {
            b"defTextVector" => ServerMessage::DefText(def_vector(head, Vec::new())),
            b"defNumberVector" => ServerMessage::DefNumber(def_vector(head, Vec::new())),
            b"defSwitchVector" => ServerMessage::DefSwitch(def_vector(head, Vec::new())),
            b"defLightVector" => ServerMessage::DefLight(def_vector(head, Vec::new())),
            b"defBLOBVector" => ServerMessage::DefBlob(def_vector(head, Vec::new())),
            b"setTextVector" => ServerMessage::SetText(set_vector(head, Vec::new())),
            b"setNumberVector" => ServerMessage::SetNumber(set_vector(head, Vec::new())),
            b"setSwitchVector" => ServerMessage::SetSwitch(set_vector(head, Vec::new())),
            b"setLightVector" => ServerMessage::SetLight(set_vector(head, Vec::new())),
            b"setBLOBVector" => ServerMessage::SetBlob(set_vector(head, Vec::new())),
            _ => return None,
        };
        Some(msg)
    }

    /// Read the children of a vector until its end tag, collecting each
    /// child's attributes and text content.
    async fn read_children(&mut self, end: &[u8]) -> IndiResult<Vec<RawElement>> {
        let mut children = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match self.reader.read_event_into_async(&mut buf).await {
                Ok(Event::Start(e)) => {
                    let child_end = e.name().as_ref().to_vec();
                    let mut child = RawElement::from_start(&e);
                    self.read_child_text(&child_end, &mut child).await?;
                    children.push(child);
                }
                Ok(Event::Empty(e)) => children.push(RawElement::from_start(&e)),
                Ok(Event::End(e)) if e.name().as_ref() == end => return Ok(children),
                Ok(Event::Eof) => {
                    return Err(IndiError::Parse(format!(
                        "unexpected end of stream inside <{}>",
                        String::from_utf8_lossy(end)
                    )))
                }
                Ok(_) => {}
                Err(e) => return Err(codec_err(e)),
            }
        }
    }

    async fn read_child_text(&mut self, end: &[u8], child: &mut RawElement) -> IndiResult<()> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match self.reader.read_event_into_async(&mut buf).await {
                Ok(Event::Text(t)) => {
                    child.text.push_str(&t.unescape().unwrap_or_default());
                }
                Ok(Event::CData(t)) => {
                    child.text.push_str(&String::from_utf8_lossy(&t));
                }
                Ok(Event::End(e)) if e.name().as_ref() == end => return Ok(()),
                Ok(Event::Eof) => {
                    return Err(IndiError::Parse(format!(
                        "unexpected end of stream inside <{}>",
                        String::from_utf8_lossy(end)
                    )))
                }
                Ok(_) => {}
                Err(e) => return Err(codec_err(e)),
            }
        }
    }

    async fn skip_to_end(&mut self, end: &[u8]) -> IndiResult<()> {
        let mut buf = Vec::new();
        self.reader
            .read_to_end_into_async(QName(end), &mut buf)
            .await
            .map_err(codec_err)?;
        Ok(())
    }
}

fn message_from(head: &RawElement) -> ServerMessage {
    ServerMessage::Message(DeviceMessage {
        device: head.attr_string("device"),
        timestamp: parse_timestamp(head.attr("timestamp")),
        message: head.attr_string("message"),
    })
}

fn del_property_from(head: &RawElement) -> ServerMessage {
    ServerMessage::DelProperty(DelProperty {
        device: head.attr_string("device"),
        name: head.attr_string("name"),
        timestamp: parse_timestamp(head.attr("timestamp")),
    })
}

/// Serialize an outbound command to its XML form.
pub fn encode(cmd: &Command) -> IndiResult<String> {
    let mut writer = Writer::new(Vec::new());
    write_command(&mut writer, cmd).map_err(codec_err)?;
    String::from_utf8(writer.into_inner()).map_err(|e| IndiError::Parse(e.to_string()))
}

fn write_command(writer: &mut Writer<Vec<u8>>, cmd: &Command) -> quick_xml::Result<()> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    match cmd {
        Command::GetProperties { device, name } => {
            let mut e = BytesStart::new("getProperties");
            e.push_attribute(("version", INDI_PROTOCOL_VERSION));
            if !device.is_empty() {
                e.push_attribute(("device", device.as_str()));
            }
            if !name.is_empty() {
                e.push_attribute(("name", name.as_str()));
            }
            writer.write_event(Event::Empty(e))?;
        }
        Command::EnableBlob { device, name, mode } => {
            let mut e = BytesStart::new("enableBLOB");
            e.push_attribute(("device", device.as_str()));
            if !name.is_empty() {
                e.push_attribute(("name", name.as_str()));
            }
            writer.write_event(Event::Start(e))?;
            writer.write_event(Event::Text(BytesText::new(mode.as_str())))?;
            writer.write_event(Event::End(BytesEnd::new("enableBLOB")))?;
        }
        Command::NewText { device, name, items } => {
            write_new_vector(writer, "newTextVector", "oneText", device, name, items, |v| {
                v.clone()
            })?;
        }
        Command::NewNumber { device, name, items } => {
            write_new_vector(writer, "newNumberVector", "oneNumber", device, name, items, |v| {
                v.clone()
            })?;
        }
        Command::NewSwitch { device, name, items } => {
            write_new_vector(writer, "newSwitchVector", "oneSwitch", device, name, items, |v| {
                v.as_str().to_string()
            })?;
        }
        Command::NewBlob { device, name, blob } => {
            let mut e = BytesStart::new("newBLOBVector");
            e.push_attribute(("device", device.as_str()));
            e.push_attribute(("name", name.as_str()));
            writer.write_event(Event::Start(e))?;
            let mut one = BytesStart::new("oneBLOB");
            one.push_attribute(("name", blob.name.as_str()));
            one.push_attribute(("size", blob.data.len().to_string().as_str()));
            one.push_attribute(("format", blob.format.as_str()));
            writer.write_event(Event::Start(one))?;
            writer.write_event(Event::Text(BytesText::new(&BASE64.encode(&blob.data))))?;
            writer.write_event(Event::End(BytesEnd::new("oneBLOB")))?;
            writer.write_event(Event::End(BytesEnd::new("newBLOBVector")))?;
        }
    }
    Ok(())
}

fn write_new_vector<V>(
    writer: &mut Writer<Vec<u8>>,
    vector: &str,
    child: &str,
    device: &str,
    name: &str,
    items: &[(String, V)],
    value_text: impl Fn(&V) -> String,
) -> quick_xml::Result<()> {
    let mut e = BytesStart::new(vector);
    e.push_attribute(("device", device));
    e.push_attribute(("name", name));
    writer.write_event(Event::Start(e))?;
    for (item_name, value) in items {
        let mut one = BytesStart::new(child);
        one.push_attribute(("name", item_name.as_str()));
        writer.write_event(Event::Start(one))?;
        writer.write_event(Event::Text(BytesText::new(&value_text(value))))?;
        writer.write_event(Event::End(BytesEnd::new(child)))?;
    }
    writer.write_event(Event::End(BytesEnd::new(vector)))?;
    Ok(())
}
