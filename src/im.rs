//! Interaction model read plumbing.
//!
//! - [ReadCallback] - sink receiving decoded report items of one read interaction
//! - [InteractionEngine] - sends read over established session and drives a sink to completion
//! - [dispatch_report_data] - splits ReportData message into per item sink calls
//! - [MessageInteractionEngine] - engine running read exchange over [ReadTransport] on tokio

use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};

use crate::{
    connection::SessionHandle,
    messages::{self, Message, ProtocolMessageHeader},
    tlv::TlvItem,
};

pub const WILDCARD_ENDPOINT: u16 = 0xffff;
pub const WILDCARD_CLUSTER: u32 = 0xffff_ffff;
pub const WILDCARD_ATTRIBUTE: u32 = 0xffff_ffff;
pub const WILDCARD_EVENT: u32 = 0xffff_ffff;

fn filter16(v: u16, wildcard: u16) -> Option<u16> {
    (v != wildcard).then_some(v)
}

fn filter32(v: u32, wildcard: u32) -> Option<u32> {
    (v != wildcard).then_some(v)
}

/// Path field; absent means wildcard, present value must fit the id type.
fn path_field<T: TryFrom<u64>>(item: &TlvItem, tag: u8, wildcard: T) -> Result<T> {
    match item.get_int(&[tag]) {
        None => Ok(wildcard),
        Some(v) => T::try_from(v).map_err(|_| anyhow::anyhow!("path field {} value 0x{:x} out of range", tag, v)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributePath {
    pub endpoint: u16,
    pub cluster: u32,
    pub attribute: u32,
}

impl AttributePath {
    pub fn new(endpoint: u16, cluster: u32, attribute: u32) -> Self {
        Self {
            endpoint,
            cluster,
            attribute,
        }
    }
    pub fn endpoint_filter(&self) -> Option<u16> {
        filter16(self.endpoint, WILDCARD_ENDPOINT)
    }
    pub fn cluster_filter(&self) -> Option<u32> {
        filter32(self.cluster, WILDCARD_CLUSTER)
    }
    pub fn attribute_filter(&self) -> Option<u32> {
        filter32(self.attribute, WILDCARD_ATTRIBUTE)
    }

    /// Decode AttributePathIB. Missing fields are wildcards.
    pub fn decode(item: &TlvItem) -> Result<Self> {
        Ok(Self {
            endpoint: path_field(item, 2, WILDCARD_ENDPOINT)?,
            cluster: path_field(item, 3, WILDCARD_CLUSTER)?,
            attribute: path_field(item, 4, WILDCARD_ATTRIBUTE)?,
        })
    }
}

impl std::fmt::Display for AttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "endpoint:{} cluster:0x{:04x} attribute:0x{:04x}",
            self.endpoint, self.cluster, self.attribute
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPath {
    pub endpoint: u16,
    pub cluster: u32,
    pub event: u32,
    pub is_urgent: bool,
}

impl EventPath {
    pub fn new(endpoint: u16, cluster: u32, event: u32) -> Self {
        Self {
            endpoint,
            cluster,
            event,
            is_urgent: false,
        }
    }
    pub fn endpoint_filter(&self) -> Option<u16> {
        filter16(self.endpoint, WILDCARD_ENDPOINT)
    }
    pub fn cluster_filter(&self) -> Option<u32> {
        filter32(self.cluster, WILDCARD_CLUSTER)
    }
    pub fn event_filter(&self) -> Option<u32> {
        filter32(self.event, WILDCARD_EVENT)
    }

    /// Decode EventPathIB. Missing fields are wildcards.
    pub fn decode(item: &TlvItem) -> Result<Self> {
        Ok(Self {
            endpoint: path_field(item, 1, WILDCARD_ENDPOINT)?,
            cluster: path_field(item, 2, WILDCARD_CLUSTER)?,
            event: path_field(item, 3, WILDCARD_EVENT)?,
            is_urgent: item.get_bool(&[4]).unwrap_or(false),
        })
    }
}

impl std::fmt::Display for EventPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "endpoint:{} cluster:0x{:04x} event:0x{:04x}",
            self.endpoint, self.cluster, self.event
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTimestamp {
    Epoch(u64),
    System(u64),
    DeltaEpoch(u64),
    DeltaSystem(u64),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub path: EventPath,
    pub event_number: u64,
    pub priority: u8,
    pub timestamp: EventTimestamp,
}

impl EventHeader {
    /// Decode header fields of EventDataIB.
    fn decode(item: &TlvItem) -> Result<Self> {
        let path = EventPath::decode(item.get_item(&[0]).context("event data without path")?)?;
        let event_number = item.get_u64(&[1]).context("event data without event number")?;
        let timestamp = if let Some(t) = item.get_u64(&[3]) {
            EventTimestamp::Epoch(t)
        } else if let Some(t) = item.get_u64(&[4]) {
            EventTimestamp::System(t)
        } else if let Some(t) = item.get_u64(&[5]) {
            EventTimestamp::DeltaEpoch(t)
        } else if let Some(t) = item.get_u64(&[6]) {
            EventTimestamp::DeltaSystem(t)
        } else {
            EventTimestamp::Unknown
        };
        Ok(Self {
            path,
            event_number,
            priority: item.get_u8(&[2]).unwrap_or(0),
            timestamp,
        })
    }
}

/// Interaction model status (StatusIB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusIB {
    pub status: u8,
    pub cluster_status: Option<u8>,
}

impl StatusIB {
    pub const SUCCESS: u8 = 0x00;
    pub const FAILURE: u8 = 0x01;
    pub const UNSUPPORTED_ACCESS: u8 = 0x7e;
    pub const UNSUPPORTED_ENDPOINT: u8 = 0x7f;
    pub const UNSUPPORTED_ATTRIBUTE: u8 = 0x86;
    pub const BUSY: u8 = 0x9c;
    pub const UNSUPPORTED_CLUSTER: u8 = 0xc3;
    pub const UNSUPPORTED_EVENT: u8 = 0xc7;

    pub fn success() -> Self {
        Self {
            status: Self::SUCCESS,
            cluster_status: None,
        }
    }
    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
    fn decode(item: &TlvItem) -> Self {
        Self {
            status: item.get_u8(&[0]).unwrap_or(Self::FAILURE),
            cluster_status: item.get_u8(&[1]),
        }
    }
}

impl std::fmt::Display for StatusIB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Self::SUCCESS => write!(f, "SUCCESS"),
            Self::FAILURE => write!(f, "FAILURE"),
            Self::UNSUPPORTED_ACCESS => write!(f, "UNSUPPORTED_ACCESS"),
            Self::UNSUPPORTED_ENDPOINT => write!(f, "UNSUPPORTED_ENDPOINT"),
            Self::UNSUPPORTED_ATTRIBUTE => write!(f, "UNSUPPORTED_ATTRIBUTE"),
            Self::BUSY => write!(f, "BUSY"),
            Self::UNSUPPORTED_CLUSTER => write!(f, "UNSUPPORTED_CLUSTER"),
            Self::UNSUPPORTED_EVENT => write!(f, "UNSUPPORTED_EVENT"),
            s => write!(f, "STATUS 0x{:02x}", s),
        }?;
        if let Some(cs) = self.cluster_status {
            write!(f, " cluster_status:0x{:02x}", cs)?;
        }
        Ok(())
    }
}

/// Paths of one read interaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadParams {
    pub attributes: Vec<AttributePath>,
    pub events: Vec<EventPath>,
    pub fabric_filtered: bool,
}

/// Consumer of read interaction results.
///
/// `on_attribute_data`, `on_event_data` and `on_error` are called zero or more times,
/// `on_done` exactly once, last.
pub trait ReadCallback: Send {
    /// `data` is None when the report carries only status for the path.
    fn on_attribute_data(&mut self, path: &AttributePath, data: Option<&TlvItem>, status: &StatusIB);
    fn on_event_data(&mut self, header: &EventHeader, data: Option<&TlvItem>, status: Option<&StatusIB>);
    fn on_error(&mut self, error: &anyhow::Error);
    fn on_done(self: Box<Self>);
}

pub trait InteractionEngine: Send + Sync {
    /// Start read. On Ok the engine owns `callback` and finishes it with `on_done`.
    /// On Err the callback was dropped and none of its methods is called.
    fn send_read(
        &self,
        session: &SessionHandle,
        params: ReadParams,
        callback: Box<dyn ReadCallback>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportFlags {
    pub more_chunks: bool,
    pub suppress_response: bool,
}

fn dispatch_attribute_report(report: &TlvItem, sink: &mut dyn ReadCallback) -> Result<()> {
    if let Some(data) = report.get_item(&[1]) {
        let path = AttributePath::decode(data.get_item(&[1]).context("attribute data without path")?)?;
        sink.on_attribute_data(&path, data.get_item(&[2]), &StatusIB::success());
    } else if let Some(status) = report.get_item(&[0]) {
        let path = AttributePath::decode(status.get_item(&[0]).context("attribute status without path")?)?;
        let st = StatusIB::decode(status.get_item(&[1]).context("attribute status without status")?);
        sink.on_attribute_data(&path, None, &st);
    } else {
        anyhow::bail!("attribute report with neither data nor status");
    }
    Ok(())
}

fn dispatch_event_report(report: &TlvItem, sink: &mut dyn ReadCallback) -> Result<()> {
    if let Some(data) = report.get_item(&[1]) {
        let header = EventHeader::decode(data)?;
        sink.on_event_data(&header, data.get_item(&[7]), None);
    } else if let Some(status) = report.get_item(&[0]) {
        let path = EventPath::decode(status.get_item(&[0]).context("event status without path")?)?;
        let st = StatusIB::decode(status.get_item(&[1]).context("event status without status")?);
        let header = EventHeader {
            path,
            event_number: 0,
            priority: 0,
            timestamp: EventTimestamp::Unknown,
        };
        sink.on_event_data(&header, None, Some(&st));
    } else {
        anyhow::bail!("event report with neither data nor status");
    }
    Ok(())
}

/// Feed every attribute and event report of ReportData payload to sink.
/// Malformed items are reported through `on_error` and skipped.
pub fn dispatch_report_data(report: &TlvItem, sink: &mut dyn ReadCallback) -> ReportFlags {
    if let Some(attrs) = report.get_item(&[1]) {
        for item in attrs.children() {
            if let Err(e) = dispatch_attribute_report(item, sink) {
                sink.on_error(&e);
            }
        }
    }
    if let Some(events) = report.get_item(&[2]) {
        for item in events.children() {
            if let Err(e) = dispatch_event_report(item, sink) {
                sink.on_error(&e);
            }
        }
    }
    ReportFlags {
        more_chunks: report.get_bool(&[3]).unwrap_or(false),
        suppress_response: report.get_bool(&[4]).unwrap_or(false),
    }
}

/// Secure message exchange used by [MessageInteractionEngine].
pub trait ReadTransport: Send + Sync + 'static {
    /// Send message on exchange and wait for response on the same exchange.
    fn request(
        &self,
        session: &SessionHandle,
        exchange: u16,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<Message>> + Send;

    /// Send message on exchange without waiting for response.
    fn send(
        &self,
        session: &SessionHandle,
        exchange: u16,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub struct MessageInteractionEngine<T> {
    transport: Arc<T>,
}

impl<T: ReadTransport> MessageInteractionEngine<T> {
    pub fn new(transport: Arc<T>) -> Arc<Self> {
        Arc::new(Self { transport })
    }
}

/// Dispatch one response of read exchange.
fn handle_response(message: &Message, sink: &mut dyn ReadCallback) -> Result<ReportFlags> {
    let ph = &message.protocol_header;
    if ph.is_interaction(ProtocolMessageHeader::INTERACTION_OPCODE_REPORT_DATA) {
        return Ok(dispatch_report_data(&message.tlv, sink));
    }
    if ph.is_interaction(ProtocolMessageHeader::INTERACTION_OPCODE_STATUS_RESP) {
        let status = message.tlv.get_u8(&[0]).unwrap_or(StatusIB::FAILURE);
        anyhow::bail!(
            "read rejected with status {}",
            StatusIB {
                status,
                cluster_status: None
            }
        );
    }
    anyhow::bail!(
        "unexpected response protocol:{} opcode:0x{:x}",
        ph.protocol_id,
        ph.opcode
    )
}

async fn run_read<T: ReadTransport>(
    transport: &T,
    session: &SessionHandle,
    exchange: u16,
    request: Vec<u8>,
    sink: &mut dyn ReadCallback,
) -> Result<()> {
    let mut response = transport.request(session, exchange, request).await?;
    loop {
        log::trace!("read exchange:{} response {:?}", exchange, response);
        let flags = handle_response(&response, sink)?;
        let status = messages::im_status_response(exchange, StatusIB::SUCCESS)?;
        if flags.more_chunks {
            response = transport.request(session, exchange, status).await?;
            continue;
        }
        if !flags.suppress_response {
            transport.send(session, exchange, status).await?;
        }
        return Ok(());
    }
}

impl<T: ReadTransport> InteractionEngine for MessageInteractionEngine<T> {
    fn send_read(
        &self,
        session: &SessionHandle,
        params: ReadParams,
        mut callback: Box<dyn ReadCallback>,
    ) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .context("no tokio runtime to run read interaction on")?;
        let exchange: u16 = rand::random();
        let request = messages::im_read_request(exchange, &params)?;
        log::debug!(
            "read exch:{} node:0x{:x} attributes:{} events:{}",
            exchange,
            session.node_id,
            params.attributes.len(),
            params.events.len()
        );
        let transport = self.transport.clone();
        let session = session.clone();
        handle.spawn(async move {
            if let Err(e) = run_read(transport.as_ref(), &session, exchange, request, callback.as_mut()).await {
                callback.on_error(&e);
            }
            callback.on_done();
        });
        Ok(())
    }
}
