//! Read session controller.
//!
//! Every read is a boxed `ReadRequest` owned first by the pending session resolution
//! and then by the interaction engine. It is released when resolution fails, when the
//! engine refuses the read, or after `on_done`. Only the last path calls the done callback.
//!
//! Example:
//! ```no_run
//! # use std::sync::Arc;
//! # use matc_groups::{connection::DeviceConnectionService, im::InteractionEngine, read};
//! # fn example(connections: Arc<dyn DeviceConnectionService>, engine: Arc<dyn InteractionEngine>) -> matc_groups::error::Result<()> {
//! let controller = read::ReadController::new(connections, engine);
//! let callbacks = read::ReadCallbacks {
//!     attribute_data: Some(Box::new(|node, path, data| {
//!         println!("node 0x{:x} {} = {:?}", node, path, data.value)
//!     })),
//!     ..Default::default()
//! };
//! read::send_read_attr_command(&controller, 0x1234, &[1], &[0x0006], &[0x0000], callbacks)?;
//! # Ok(())
//! # }
//! ```

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    connection::{ConnectionFailure, DeviceConnectionService, SessionHandle},
    error::{Error, Result},
    im::{AttributePath, EventHeader, EventPath, InteractionEngine, ReadCallback, ReadParams, StatusIB},
    tlv::TlvItem,
};

pub type AttributeDataFn = Box<dyn FnMut(u64, &AttributePath, TlvItem) + Send>;
pub type EventDataFn = Box<dyn FnMut(u64, &EventHeader, TlvItem) + Send>;
pub type ReadDoneFn = Box<dyn FnOnce(u64, &[AttributePath], &[EventPath]) + Send>;

/// Optional consumers of one read. Payloads are handed over as owned copies.
#[derive(Default)]
pub struct ReadCallbacks {
    pub attribute_data: Option<AttributeDataFn>,
    pub event_data: Option<EventDataFn>,
    pub done: Option<ReadDoneFn>,
    pub stats: Option<Arc<ReadStats>>,
}

/// Per item counters, shared by reads that were given the same instance.
#[derive(Debug, Default)]
pub struct ReadStats {
    attributes: AtomicUsize,
    events: AtomicUsize,
    dropped_attributes: AtomicUsize,
    dropped_events: AtomicUsize,
    errors: AtomicUsize,
}

impl ReadStats {
    pub fn attributes(&self) -> usize {
        self.attributes.load(Ordering::Relaxed)
    }
    pub fn events(&self) -> usize {
        self.events.load(Ordering::Relaxed)
    }
    /// Attribute items skipped because of failure status or missing payload.
    pub fn dropped_attributes(&self) -> usize {
        self.dropped_attributes.load(Ordering::Relaxed)
    }
    pub fn dropped_events(&self) -> usize {
        self.dropped_events.load(Ordering::Relaxed)
    }
    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Created,
    AwaitingConnection,
    Reading,
}

struct ReadRequest {
    node_id: u64,
    attributes: Vec<AttributePath>,
    events: Vec<EventPath>,
    callbacks: ReadCallbacks,
    state: ReadState,
}

impl ReadRequest {
    fn set_state(&mut self, state: ReadState) {
        log::debug!(
            "read node:0x{:x} {:?} -> {:?}",
            self.node_id,
            self.state,
            state
        );
        self.state = state;
    }

    fn count(&self, counter: impl Fn(&ReadStats) -> &AtomicUsize) {
        if let Some(stats) = &self.callbacks.stats {
            counter(stats).fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_device_connected(mut self: Box<Self>, engine: &dyn InteractionEngine, session: SessionHandle) {
        let params = ReadParams {
            attributes: self.attributes.clone(),
            events: self.events.clone(),
            fabric_filtered: false,
        };
        let node_id = self.node_id;
        self.set_state(ReadState::Reading);
        if let Err(e) = engine.send_read(&session, params, self) {
            log::error!("send read request to node 0x{:x} failed: {:#}", node_id, e);
        }
    }

    fn on_device_connection_failure(self: Box<Self>, failure: ConnectionFailure) {
        log::error!("{}", failure);
    }
}

impl ReadCallback for ReadRequest {
    fn on_attribute_data(&mut self, path: &AttributePath, data: Option<&TlvItem>, status: &StatusIB) {
        if !status.is_success() {
            log::error!("node 0x{:x} attribute {} status {}", self.node_id, path, status);
            self.count(|s| &s.dropped_attributes);
            return;
        }
        let Some(data) = data else {
            log::error!("node 0x{:x} attribute {} without data", self.node_id, path);
            self.count(|s| &s.dropped_attributes);
            return;
        };
        if let Some(cb) = self.callbacks.attribute_data.as_mut() {
            cb(self.node_id, path, data.clone());
        }
        log::info!("node 0x{:x} attribute {}", self.node_id, path);
        data.log_dump(1);
        self.count(|s| &s.attributes);
    }

    fn on_event_data(&mut self, header: &EventHeader, data: Option<&TlvItem>, status: Option<&StatusIB>) {
        if let Some(status) = status.filter(|s| !s.is_success()) {
            log::error!("node 0x{:x} event {} status {}", self.node_id, header.path, status);
            self.count(|s| &s.dropped_events);
            return;
        }
        let Some(data) = data else {
            log::error!("node 0x{:x} event {} without data", self.node_id, header.path);
            self.count(|s| &s.dropped_events);
            return;
        };
        if let Some(cb) = self.callbacks.event_data.as_mut() {
            cb(self.node_id, header, data.clone());
        }
        log::info!(
            "node 0x{:x} event {} number:{} priority:{}",
            self.node_id,
            header.path,
            header.event_number,
            header.priority
        );
        data.log_dump(1);
        self.count(|s| &s.events);
    }

    fn on_error(&mut self, error: &anyhow::Error) {
        log::error!("read from node 0x{:x} error: {:#}", self.node_id, error);
        self.count(|s| &s.errors);
    }

    fn on_done(mut self: Box<Self>) {
        log::debug!("read node:0x{:x} done", self.node_id);
        if let Some(done) = self.callbacks.done.take() {
            done(self.node_id, &self.attributes, &self.events);
        }
    }
}

impl Drop for ReadRequest {
    fn drop(&mut self) {
        log::trace!("read node:0x{:x} released in state {:?}", self.node_id, self.state);
    }
}

fn copy_paths<T: Copy>(paths: &[T]) -> Result<Vec<T>> {
    let mut out = Vec::new();
    out.try_reserve_exact(paths.len())?;
    out.extend_from_slice(paths);
    Ok(out)
}

/// Starts reads against remote nodes using injected connection service and interaction engine.
pub struct ReadController {
    connections: Arc<dyn DeviceConnectionService>,
    engine: Arc<dyn InteractionEngine>,
}

impl ReadController {
    pub fn new(connections: Arc<dyn DeviceConnectionService>, engine: Arc<dyn InteractionEngine>) -> Self {
        Self { connections, engine }
    }

    pub fn start_attribute_read(&self, node_id: u64, paths: &[AttributePath], callbacks: ReadCallbacks) -> Result<()> {
        self.start(node_id, copy_paths(paths)?, Vec::new(), callbacks)
    }

    pub fn start_event_read(&self, node_id: u64, paths: &[EventPath], callbacks: ReadCallbacks) -> Result<()> {
        self.start(node_id, Vec::new(), copy_paths(paths)?, callbacks)
    }

    /// Read attributes and events in one interaction.
    pub fn start_read(
        &self,
        node_id: u64,
        attributes: &[AttributePath],
        events: &[EventPath],
        callbacks: ReadCallbacks,
    ) -> Result<()> {
        self.start(node_id, copy_paths(attributes)?, copy_paths(events)?, callbacks)
    }

    /// Ok means session resolution was scheduled. Data, if any, arrives later through callbacks.
    fn start(
        &self,
        node_id: u64,
        attributes: Vec<AttributePath>,
        events: Vec<EventPath>,
        callbacks: ReadCallbacks,
    ) -> Result<()> {
        let mut request = Box::new(ReadRequest {
            node_id,
            attributes,
            events,
            callbacks,
            state: ReadState::Created,
        });
        request.set_state(ReadState::AwaitingConnection);
        let engine = self.engine.clone();
        self.connections
            .resolve_session(
                node_id,
                Box::new(move |result: std::result::Result<SessionHandle, ConnectionFailure>| match result {
                    Ok(session) => request.on_device_connected(engine.as_ref(), session),
                    Err(failure) => request.on_device_connection_failure(failure),
                }),
            )
            .map_err(|e| {
                log::error!("can't schedule session resolution for node 0x{:x}: {:#}", node_id, e);
                Error::Fail(e.context("schedule session resolution"))
            })
    }
}

/// Read one attribute per index of parallel id slices.
pub fn send_read_attr_command(
    controller: &ReadController,
    node_id: u64,
    endpoints: &[u16],
    clusters: &[u32],
    attributes: &[u32],
    callbacks: ReadCallbacks,
) -> Result<()> {
    if endpoints.len() != clusters.len() || endpoints.len() != attributes.len() {
        return Err(Error::invalid(format!(
            "path arrays differ in length: endpoints:{} clusters:{} attributes:{}",
            endpoints.len(),
            clusters.len(),
            attributes.len()
        )));
    }
    let mut paths = Vec::new();
    paths.try_reserve_exact(endpoints.len())?;
    for ((e, c), a) in endpoints.iter().zip(clusters).zip(attributes) {
        paths.push(AttributePath::new(*e, *c, *a));
    }
    controller.start(node_id, paths, Vec::new(), callbacks)
}

/// Read one event per index of parallel id slices.
pub fn send_read_event_command(
    controller: &ReadController,
    node_id: u64,
    endpoints: &[u16],
    clusters: &[u32],
    events: &[u32],
    callbacks: ReadCallbacks,
) -> Result<()> {
    if endpoints.len() != clusters.len() || endpoints.len() != events.len() {
        return Err(Error::invalid(format!(
            "path arrays differ in length: endpoints:{} clusters:{} events:{}",
            endpoints.len(),
            clusters.len(),
            events.len()
        )));
    }
    let mut paths = Vec::new();
    paths.try_reserve_exact(endpoints.len())?;
    for ((e, c), ev) in endpoints.iter().zip(clusters).zip(events) {
        paths.push(EventPath::new(*e, *c, *ev));
    }
    controller.start(node_id, Vec::new(), paths, callbacks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::ConnectionCallback,
        im::{self, WILDCARD_ATTRIBUTE, WILDCARD_ENDPOINT},
        tlv,
    };
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Resolution {
        Connect,
        Fail,
        Refuse,
    }

    struct MockConnections {
        resolution: Resolution,
        calls: AtomicUsize,
    }

    impl MockConnections {
        fn new(resolution: Resolution) -> Arc<Self> {
            Arc::new(Self {
                resolution,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl DeviceConnectionService for MockConnections {
        fn resolve_session(&self, node_id: u64, on_result: ConnectionCallback) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.resolution {
                Resolution::Connect => on_result(Ok(SessionHandle {
                    node_id,
                    fabric_index: 1,
                    session_id: 7,
                })),
                Resolution::Fail => on_result(Err(ConnectionFailure {
                    node_id,
                    error: anyhow::anyhow!("no route to node"),
                })),
                Resolution::Refuse => anyhow::bail!("connection service stopped"),
            }
            Ok(())
        }
    }

    /// Engine keeping accepted sinks so test can drive them.
    struct MockEngine {
        accept: bool,
        reads: Mutex<Vec<(ReadParams, Box<dyn ReadCallback>)>>,
        refused: AtomicUsize,
    }

    impl MockEngine {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept,
                reads: Mutex::new(Vec::new()),
                refused: AtomicUsize::new(0),
            })
        }

        fn take(&self) -> (ReadParams, Box<dyn ReadCallback>) {
            self.reads.lock().unwrap().pop().expect("no read was sent")
        }
    }

    impl InteractionEngine for MockEngine {
        fn send_read(
            &self,
            _session: &SessionHandle,
            params: ReadParams,
            callback: Box<dyn ReadCallback>,
        ) -> anyhow::Result<()> {
            if !self.accept {
                self.refused.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("exchange table full");
            }
            self.reads.lock().unwrap().push((params, callback));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Observed {
        attributes: Vec<(u64, AttributePath, TlvItem)>,
        events: Vec<(u64, u64, TlvItem)>,
        done: Vec<(u64, Vec<AttributePath>, Vec<EventPath>)>,
    }

    fn observing(stats: &Arc<ReadStats>) -> (Arc<Mutex<Observed>>, ReadCallbacks) {
        let observed = Arc::new(Mutex::new(Observed::default()));
        let (a, e, d) = (observed.clone(), observed.clone(), observed.clone());
        let callbacks = ReadCallbacks {
            attribute_data: Some(Box::new(move |node, path, data| {
                a.lock().unwrap().attributes.push((node, *path, data))
            })),
            event_data: Some(Box::new(move |node, header, data| {
                e.lock().unwrap().events.push((node, header.event_number, data))
            })),
            done: Some(Box::new(move |node, attrs, events| {
                d.lock().unwrap().done.push((node, attrs.to_vec(), events.to_vec()))
            })),
            stats: Some(stats.clone()),
        };
        (observed, callbacks)
    }

    fn controller(connections: &Arc<MockConnections>, engine: &Arc<MockEngine>) -> ReadController {
        ReadController::new(connections.clone(), engine.clone())
    }

    #[test]
    fn mismatched_path_arrays_are_rejected() {
        let connections = MockConnections::new(Resolution::Connect);
        let engine = MockEngine::new(true);
        let c = controller(&connections, &engine);
        let res = send_read_attr_command(&c, 1, &[1, 2], &[6], &[0], ReadCallbacks::default());
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
        let res = send_read_event_command(&c, 1, &[1], &[6, 8], &[0, 1], ReadCallbacks::default());
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
        assert_eq!(connections.calls.load(Ordering::SeqCst), 0);
        assert!(engine.reads.lock().unwrap().is_empty());
    }

    #[test]
    fn report_is_fanned_out_and_done_fires_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let connections = MockConnections::new(Resolution::Connect);
        let engine = MockEngine::new(true);
        let c = controller(&connections, &engine);
        let stats = Arc::new(ReadStats::default());
        let (observed, callbacks) = observing(&stats);

        send_read_attr_command(
            &c,
            0x1234,
            &[1, WILDCARD_ENDPOINT],
            &[0x0006, 0x0006],
            &[0x0000, WILDCARD_ATTRIBUTE],
            callbacks,
        )
        .unwrap();

        let (params, mut sink) = engine.take();
        assert_eq!(params.attributes.len(), 2);
        assert_eq!(params.attributes[1].endpoint_filter(), None);
        assert!(params.events.is_empty());

        let report = tlv::decode_tlv(&im::tests::sample_report(false)).unwrap();
        im::dispatch_report_data(&report, sink.as_mut());
        sink.on_error(&anyhow::anyhow!("late chunk"));
        {
            let o = observed.lock().unwrap();
            assert_eq!(o.attributes.len(), 1);
            assert_eq!(o.attributes[0].0, 0x1234);
            assert_eq!(o.attributes[0].1, AttributePath::new(1, 6, 0));
            assert_eq!(o.attributes[0].2.value, tlv::TlvItemValue::Bool(true));
            assert_eq!(o.events.len(), 1);
            assert_eq!(o.events[0].1, 42);
            // errors alone do not finish read
            assert!(o.done.is_empty());
        }
        sink.on_done();

        let o = observed.lock().unwrap();
        assert_eq!(o.done.len(), 1);
        assert_eq!(o.done[0].0, 0x1234);
        assert_eq!(o.done[0].1, params.attributes);
        assert!(o.done[0].2.is_empty());
        assert_eq!(stats.attributes(), 1);
        assert_eq!(stats.dropped_attributes(), 1);
        assert_eq!(stats.events(), 1);
        assert_eq!(stats.errors(), 1);
        // request released after done
        assert_eq!(Arc::strong_count(&stats), 1);
    }

    #[test]
    fn items_without_payload_or_with_failure_status_are_dropped() {
        let connections = MockConnections::new(Resolution::Connect);
        let engine = MockEngine::new(true);
        let c = controller(&connections, &engine);
        let stats = Arc::new(ReadStats::default());
        let (observed, callbacks) = observing(&stats);
        c.start_event_read(0x10, &[EventPath::new(0, 0x28, 0)], callbacks).unwrap();

        let (params, mut sink) = engine.take();
        assert_eq!(params.events, vec![EventPath::new(0, 0x28, 0)]);
        let header = EventHeader {
            path: params.events[0],
            event_number: 3,
            priority: 1,
            timestamp: im::EventTimestamp::Unknown,
        };
        let busy = StatusIB {
            status: StatusIB::UNSUPPORTED_EVENT,
            cluster_status: None,
        };
        sink.on_event_data(&header, None, Some(&busy));
        sink.on_event_data(&header, None, None);
        sink.on_attribute_data(&AttributePath::new(0, 0x28, 1), None, &StatusIB::success());
        sink.on_done();

        let o = observed.lock().unwrap();
        assert!(o.events.is_empty());
        assert!(o.attributes.is_empty());
        assert_eq!(o.done.len(), 1);
        assert_eq!(o.done[0].2, params.events);
        assert_eq!(stats.dropped_events(), 2);
        assert_eq!(stats.dropped_attributes(), 1);
    }

    #[test]
    fn attribute_and_event_read_share_interaction() {
        let connections = MockConnections::new(Resolution::Connect);
        let engine = MockEngine::new(true);
        let c = controller(&connections, &engine);
        c.start_read(
            5,
            &[AttributePath::new(1, 6, 0)],
            &[EventPath::new(1, 0x3b, 1)],
            ReadCallbacks::default(),
        )
        .unwrap();
        let (params, sink) = engine.take();
        assert_eq!(params.attributes.len(), 1);
        assert_eq!(params.events.len(), 1);
        // no consumers registered
        sink.on_done();
    }

    #[test]
    fn connection_failure_is_silent() {
        let connections = MockConnections::new(Resolution::Fail);
        let engine = MockEngine::new(true);
        let c = controller(&connections, &engine);
        let stats = Arc::new(ReadStats::default());
        let (observed, callbacks) = observing(&stats);

        // scheduling succeeded, so caller sees Ok
        send_read_attr_command(&c, 0x1234, &[1], &[0x0006], &[0x0000], callbacks).unwrap();

        assert_eq!(connections.calls.load(Ordering::SeqCst), 1);
        assert!(engine.reads.lock().unwrap().is_empty());
        let o = observed.lock().unwrap();
        assert!(o.attributes.is_empty());
        assert!(o.done.is_empty());
        assert_eq!(Arc::strong_count(&stats), 1);
    }

    #[test]
    fn refused_scheduling_is_fail() {
        let connections = MockConnections::new(Resolution::Refuse);
        let engine = MockEngine::new(true);
        let c = controller(&connections, &engine);
        let stats = Arc::new(ReadStats::default());
        let (observed, callbacks) = observing(&stats);

        let res = c.start_attribute_read(9, &[AttributePath::new(1, 6, 0)], callbacks);
        assert!(matches!(res, Err(Error::Fail(_))));
        assert!(observed.lock().unwrap().done.is_empty());
        assert_eq!(Arc::strong_count(&stats), 1);
    }

    #[test]
    fn send_failure_releases_without_done() {
        let connections = MockConnections::new(Resolution::Connect);
        let engine = MockEngine::new(false);
        let c = controller(&connections, &engine);
        let stats = Arc::new(ReadStats::default());
        let (observed, callbacks) = observing(&stats);

        c.start_attribute_read(9, &[AttributePath::new(1, 6, 0)], callbacks).unwrap();

        assert_eq!(engine.refused.load(Ordering::SeqCst), 1);
        assert!(observed.lock().unwrap().done.is_empty());
        assert_eq!(Arc::strong_count(&stats), 1);
    }
}
