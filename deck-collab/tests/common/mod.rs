//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use deck_collab::{
    CollabContext, ConnectionPool, Connector, Identity, LocalConnector, PeerInfo, RoomHub, SyncConfig, SyncError,
    TransportHandle,
};
use deck_core::{ComponentRecord, SlideData, SlideRecord};

/// Context for `actor` talking to `hub` in-process.
pub fn hub_context(hub: &Arc<RoomHub>, actor: &str, configure: impl FnOnce(&mut SyncConfig)) -> Arc<CollabContext> {
    let mut config = SyncConfig::default();
    configure(&mut config);
    let connector = Arc::new(LocalConnector::new(hub.clone()));
    CollabContext::new(config, Identity::new(actor, capitalize(actor)), connector)
}

pub fn pool_on(hub: &Arc<RoomHub>, max_connections: usize) -> Arc<ConnectionPool> {
    let mut config = SyncConfig::default();
    config.pool.max_connections = max_connections;
    let connector = Arc::new(LocalConnector::new(hub.clone()));
    Arc::new(ConnectionPool::new(config, Identity::new("tester", "Tester"), connector))
}

/// Connector whose every attempt fails with a transport error.
#[derive(Default)]
pub struct RefusingConnector {
    pub attempts: AtomicUsize,
}

impl Connector for RefusingConnector {
    fn connect(&self, room: &str, _peer: &PeerInfo) -> BoxFuture<'static, deck_collab::Result<TransportHandle>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let room = room.to_string();
        Box::pin(async move { Err(SyncError::Transport(format!("{room}: connection refused"))) })
    }
}

pub fn slide(id: &str, components: &[&str]) -> SlideData {
    SlideData {
        slide: SlideRecord::new(id, format!("Slide {id}")),
        components: components
            .iter()
            .map(|c| ComponentRecord::new(*c, "text").with_prop("text", format!("{c} on {id}")))
            .collect(),
    }
}

pub fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("s{i}")).collect()
}

/// Poll `check` until it holds, failing the test after three seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
