//! Resolution of node id to secure session.
//!
//! [DeviceConnectionService] is the callback based contract used by the read controller.
//! [ResolvingConnectionService] adapts any async [SessionResolver] (for example one that
//! runs CASE against the node) to that contract using tokio.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};

use crate::fabric::FabricIndex;

/// Established secure session to remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub node_id: u64,
    pub fabric_index: FabricIndex,
    pub session_id: u16,
}

#[derive(Debug)]
pub struct ConnectionFailure {
    pub node_id: u64,
    pub error: anyhow::Error,
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection to node 0x{:x} failed: {:#}", self.node_id, self.error)
    }
}

pub type ConnectionCallback =
    Box<dyn FnOnce(std::result::Result<SessionHandle, ConnectionFailure>) + Send>;

pub trait DeviceConnectionService: Send + Sync {
    /// Schedule session resolution for node. When this returns Ok, `on_result` is called
    /// exactly once later. When it returns Err, `on_result` was dropped without being called.
    fn resolve_session(&self, node_id: u64, on_result: ConnectionCallback) -> Result<()>;
}

pub trait SessionResolver: Send + Sync + 'static {
    fn resolve(&self, node_id: u64) -> impl Future<Output = Result<SessionHandle>> + Send;
}

/// Runs [SessionResolver] on current tokio runtime and caches established sessions per node.
pub struct ResolvingConnectionService<R> {
    resolver: Arc<R>,
    sessions: Arc<Mutex<HashMap<u64, SessionHandle>>>,
}

impl<R: SessionResolver> ResolvingConnectionService<R> {
    pub fn new(resolver: R) -> Arc<Self> {
        Arc::new(Self {
            resolver: Arc::new(resolver),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Drop cached session so next read resolves again.
    pub fn evict(&self, node_id: u64) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&node_id);
        }
    }

    fn cached(sessions: &Mutex<HashMap<u64, SessionHandle>>, node_id: u64) -> Option<SessionHandle> {
        sessions.lock().ok()?.get(&node_id).cloned()
    }
}

impl<R: SessionResolver> DeviceConnectionService for ResolvingConnectionService<R> {
    fn resolve_session(&self, node_id: u64, on_result: ConnectionCallback) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .context("no tokio runtime to resolve session on")?;
        let resolver = self.resolver.clone();
        let sessions = self.sessions.clone();
        handle.spawn(async move {
            if let Some(session) = Self::cached(&sessions, node_id) {
                log::trace!("reusing session {} for node 0x{:x}", session.session_id, node_id);
                on_result(Ok(session));
                return;
            }
            match resolver.resolve(node_id).await {
                Ok(session) => {
                    log::debug!("session {} established with node 0x{:x}", session.session_id, node_id);
                    if let Ok(mut s) = sessions.lock() {
                        s.insert(node_id, session.clone());
                    }
                    on_result(Ok(session));
                }
                Err(error) => {
                    log::debug!("resolving node 0x{:x} failed: {:#}", node_id, error);
                    on_result(Err(ConnectionFailure { node_id, error }));
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: Arc<AtomicUsize>,
    }

    impl SessionResolver for CountingResolver {
        async fn resolve(&self, node_id: u64) -> Result<SessionHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if node_id == 0xdead {
                anyhow::bail!("no route to node");
            }
            Ok(SessionHandle {
                node_id,
                fabric_index: 1,
                session_id: 0x1000 + node_id as u16,
            })
        }
    }

    async fn resolve(
        service: &ResolvingConnectionService<CountingResolver>,
        node_id: u64,
    ) -> std::result::Result<SessionHandle, ConnectionFailure> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        service
            .resolve_session(
                node_id,
                Box::new(move |r| {
                    let _ = tx.send(r);
                }),
            )
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn resolves_and_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = ResolvingConnectionService::new(CountingResolver { calls: calls.clone() });

        let s = resolve(&service, 0x1234).await.unwrap();
        assert_eq!(s.node_id, 0x1234);
        let s2 = resolve(&service, 0x1234).await.unwrap();
        assert_eq!(s, s2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        service.evict(0x1234);
        resolve(&service, 0x1234).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_is_reported_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = ResolvingConnectionService::new(CountingResolver { calls });
        let err = resolve(&service, 0xdead).await.unwrap_err();
        assert_eq!(err.node_id, 0xdead);
        assert!(err.to_string().contains("no route"));
    }

    #[test]
    fn without_runtime_nothing_is_scheduled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = ResolvingConnectionService::new(CountingResolver { calls: calls.clone() });
        let res = service.resolve_session(1, Box::new(|_| panic!("must not be called")));
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
