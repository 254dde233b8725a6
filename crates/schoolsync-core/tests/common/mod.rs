//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use schoolsync_core::{
    OfflineConfig, OfflineCoordinator, Record, RemoteEndpoint, RemoteRequest, RemoteResponse,
    SyncError, SyncResult,
};
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// Remote that records every request and answers from a script.
///
/// Once the script runs out every push is accepted.
#[derive(Default)]
pub struct ScriptedRemote {
    requests: Mutex<Vec<RemoteRequest>>,
    script: Mutex<VecDeque<SyncResult<RemoteResponse>>>,
    /// When set, each push waits for a permit
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Remote whose pushes block until `gate` hands out permits
    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn respond(&self, response: SyncResult<RemoteResponse>) {
        self.script.lock().push_back(response);
    }

    pub fn fail_times(&self, n: usize) {
        for _ in 0..n {
            self.respond(Err(SyncError::Network("link down".into())));
        }
    }

    pub fn conflict_with(&self, record: Record) {
        self.respond(Ok(RemoteResponse::Conflict(Box::new(record))));
    }

    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl RemoteEndpoint for ScriptedRemote {
    async fn push(&self, request: &RemoteRequest) -> SyncResult<RemoteResponse> {
        self.requests.lock().push(request.clone());
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| SyncError::Network("gate closed".into()))?;
            permit.forget();
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or(Ok(RemoteResponse::Accepted))
    }
}

/// Config with no pacing or backoff, starting online
pub fn fast_config() -> OfflineConfig {
    OfflineConfig::default()
        .with_inter_item_delay(Duration::ZERO)
        .with_retry_base_delay(Duration::ZERO)
}

/// Coordinator over a redb database in a fresh temp dir
pub fn redb_coordinator(
    config: OfflineConfig,
    remote: Arc<ScriptedRemote>,
) -> (OfflineCoordinator, TempDir) {
    let dir = TempDir::new().unwrap();
    let coordinator = OfflineCoordinator::open(dir.path(), config, remote).unwrap();
    (coordinator, dir)
}
