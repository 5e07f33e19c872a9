//! The device informer (§4.E): turns the controller's watch stream into a
//! keyed, revision-ordered cache plus a `changed` signal, reconnecting
//! automatically after a stream close or decode error.

use crate::controller::{ControllerClient, WatchEvent};
use fabric_shared::{AgentError, Device};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Notify, RwLock};

#[derive(Clone)]
pub struct Informer {
    inner: Arc<Inner>,
}

struct Inner {
    cache: RwLock<HashMap<String, Device>>,
    changed: Notify,
    synced: Notify,
    state: RwLock<State>,
    /// Set by `run_once` on a stream failure, consumed once by the next
    /// `execute()` call so the driver can distinguish `AuthExpired` (§4.F
    /// step 1) from the errors `run_informer_loop` already retries on its
    /// own.
    last_error: RwLock<Option<AgentError>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    PreSync,
    InSync,
}

impl Informer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: RwLock::new(HashMap::new()),
                changed: Notify::new(),
                synced: Notify::new(),
                state: RwLock::new(State::PreSync),
                last_error: RwLock::new(None),
            }),
        }
    }

    async fn record_error(&self, err: AgentError) {
        *self.inner.last_error.write().await = Some(err);
        self.inner.changed.notify_one();
    }

    /// A future that resolves once per batch of cache updates after the
    /// initial sync completes. Non-coalescing beyond one pending permit.
    pub fn changed(&self) -> impl std::future::Future<Output = ()> + '_ {
        self.inner.changed.notified()
    }

    /// Returns the current snapshot, keyed by `public_key`, plus any error
    /// `run_once` recorded since the last call (§4.E: `execute() -> (snapshot,
    /// error)`). Blocks until the first `bookmark` has been observed.
    pub async fn execute(&self) -> (HashMap<String, Device>, Option<AgentError>) {
        if *self.inner.state.read().await == State::PreSync {
            self.inner.synced.notified().await;
        }
        let snapshot = self.inner.cache.read().await.clone();
        let error = self.inner.last_error.write().await.take();
        (snapshot, error)
    }

    /// Drives the stream to completion, applying events to the cache as they
    /// arrive. Returns the last-seen revision on a clean close (so the
    /// caller can resume with `gt_revision`), or an error on a transport
    /// failure.
    pub async fn run_once(
        &self,
        client: &ControllerClient,
        org: &str,
        gt_revision: u64,
    ) -> Result<u64, AgentError> {
        let mut rx = match client.list_devices_watch(org, gt_revision).await {
            Ok(rx) => rx,
            Err(e) => {
                self.record_error(e.clone()).await;
                return Err(e);
            },
        };
        let mut last_revision = gt_revision;
        let mut scratch: HashMap<String, Device> = HashMap::new();

        while let Some(event) = rx.recv().await {
            let state = *self.inner.state.read().await;
            match event {
                WatchEvent::Change(device) => {
                    last_revision = last_revision.max(device.revision);
                    match state {
                        State::PreSync => {
                            scratch.insert(device.public_key.clone(), device);
                        },
                        State::InSync => {
                            self.inner
                                .cache
                                .write()
                                .await
                                .insert(device.public_key.clone(), device);
                            self.inner.changed.notify_one();
                        },
                    }
                },
                WatchEvent::Delete(public_key) => match state {
                    State::PreSync => {
                        scratch.remove(&public_key);
                    },
                    State::InSync => {
                        self.inner.cache.write().await.remove(&public_key);
                        self.inner.changed.notify_one();
                    },
                },
                WatchEvent::Bookmark => {
                    if state == State::PreSync {
                        *self.inner.cache.write().await = std::mem::take(&mut scratch);
                        *self.inner.state.write().await = State::InSync;
                        self.inner.changed.notify_one();
                        self.inner.synced.notify_waiters();
                    }
                },
                WatchEvent::Close => {
                    break;
                },
                WatchEvent::Error(message) => {
                    let err = AgentError::TransientNetwork(message);
                    self.record_error(err.clone()).await;
                    return Err(err);
                },
            }
        }

        Ok(last_revision)
    }
}

impl Default for Informer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_blocks_until_bookmark() {
        let informer = Informer::new();
        *informer.inner.state.write().await = State::InSync;
        let (snapshot, error) = informer.execute().await;
        assert!(snapshot.is_empty());
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn execute_surfaces_a_recorded_error_once() {
        let informer = Informer::new();
        *informer.inner.state.write().await = State::InSync;
        informer.record_error(AgentError::AuthExpired).await;

        let (_, first) = informer.execute().await;
        assert!(matches!(first, Some(AgentError::AuthExpired)));

        let (_, second) = informer.execute().await;
        assert!(second.is_none());
    }
}
