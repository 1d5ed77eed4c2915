//! Runtime status store.
//!
//! `StatusStore` is the single writer of `RuntimeInfo`. Every change goes through
//! `transition`, which validates the edge against the lifecycle graph and
//! publishes the new record to subscribers while still holding the per-service
//! slot lock, so observers see transitions in commit order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::errors::TransitionError;
use crate::model::{RuntimeInfo, ServiceId, ServiceStatus};

const CHANNEL_CAPACITY: usize = 64;

/// A status change together with the details it records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Starting,
    Running {
        pid: u32,
        started_at: DateTime<Utc>,
        mode: Option<String>,
        arg_preset: Option<String>,
    },
    Stopped {
        exit_code: Option<i32>,
    },
    Failed {
        message: String,
        exit_code: Option<i32>,
    },
}

impl Transition {
    pub fn target(&self) -> ServiceStatus {
        match self {
            Transition::Starting => ServiceStatus::Starting,
            Transition::Running { .. } => ServiceStatus::Running,
            Transition::Stopped { .. } => ServiceStatus::Stopped,
            Transition::Failed { .. } => ServiceStatus::Error,
        }
    }
}

struct Slot {
    info: RuntimeInfo,
    tx: broadcast::Sender<RuntimeInfo>,
}

/// Mapping from service id to its current `RuntimeInfo`.
#[derive(Default)]
pub struct StatusStore {
    slots: DashMap<ServiceId, Arc<Mutex<Slot>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &ServiceId) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.get(id) {
            return slot.clone();
        }
        self.slots
            .entry(id.clone())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                Arc::new(Mutex::new(Slot {
                    info: RuntimeInfo::stopped(id.clone()),
                    tx,
                }))
            })
            .clone()
    }

    /// Current record; services never seen before are `stopped`.
    pub fn get(&self, id: &ServiceId) -> RuntimeInfo {
        self.slot(id).lock().info.clone()
    }

    /// Subscribes to a service. The current record is delivered first.
    pub fn subscribe(&self, id: &ServiceId) -> StatusSubscription {
        let slot = self.slot(id);
        let slot = slot.lock();
        StatusSubscription {
            pending: Some(slot.info.clone()),
            rx: slot.tx.subscribe(),
        }
    }

    /// Applies a transition atomically for one service and publishes it.
    pub(crate) fn transition(
        &self,
        id: &ServiceId,
        transition: Transition,
    ) -> Result<RuntimeInfo, TransitionError> {
        let slot = self.slot(id);
        let mut slot = slot.lock();
        let from = slot.info.status;
        let to = transition.target();
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                service: id.clone(),
                from,
                to,
            });
        }

        let info = &mut slot.info;
        info.status = to;
        match transition {
            Transition::Starting => {
                info.pid = None;
                info.error = None;
            }
            Transition::Running {
                pid,
                started_at,
                mode,
                arg_preset,
            } => {
                info.pid = Some(pid);
                info.started_at = Some(started_at);
                info.active_mode = mode;
                info.active_arg_preset = arg_preset;
            }
            Transition::Stopped { exit_code } => {
                info.pid = None;
                info.started_at = None;
                info.exit_code = exit_code;
                info.active_mode = None;
                info.active_arg_preset = None;
            }
            Transition::Failed { message, exit_code } => {
                info.pid = None;
                info.started_at = None;
                info.exit_code = exit_code;
                info.error = Some(message);
                info.active_mode = None;
                info.active_arg_preset = None;
            }
        }

        let info = slot.info.clone();
        debug!(service = %id, from = %from, to = %to, "status transition");
        if slot.tx.send(info.clone()).is_err() {
            trace!(service = %id, "no status subscribers");
        }
        Ok(info)
    }

    /// Drops a service's record. Open subscriptions end.
    pub fn remove(&self, id: &ServiceId) {
        self.slots.remove(id);
    }

    /// Records for every service observed so far.
    pub fn snapshot(&self) -> Vec<RuntimeInfo> {
        let slots: Vec<Arc<Mutex<Slot>>> =
            self.slots.iter().map(|entry| entry.value().clone()).collect();
        let mut infos: Vec<RuntimeInfo> =
            slots.iter().map(|slot| slot.lock().info.clone()).collect();
        infos.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        infos
    }
}

/// Ordered stream of `RuntimeInfo` for one service.
pub struct StatusSubscription {
    pending: Option<RuntimeInfo>,
    rx: broadcast::Receiver<RuntimeInfo>,
}

impl StatusSubscription {
    /// Waits for the next record. Returns `None` once the service is removed.
    pub async fn recv(&mut self) -> Option<RuntimeInfo> {
        if let Some(info) = self.pending.take() {
            return Some(info);
        }
        loop {
            match self.rx.recv().await {
                Ok(info) => return Some(info),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "status subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next record if one is already buffered.
    pub fn try_recv(&mut self) -> Option<RuntimeInfo> {
        if let Some(info) = self.pending.take() {
            return Some(info);
        }
        loop {
            match self.rx.try_recv() {
                Ok(info) => return Some(info),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> ServiceId {
        ServiceId::new(value).unwrap()
    }

    fn running(pid: u32) -> Transition {
        Transition::Running {
            pid,
            started_at: Utc::now(),
            mode: None,
            arg_preset: None,
        }
    }

    #[test]
    fn unseen_service_is_stopped() {
        let store = StatusStore::new();
        let info = store.get(&id("api"));
        assert_eq!(info.status, ServiceStatus::Stopped);
        assert_eq!(info.pid, None);
    }

    #[test]
    fn rejects_skipped_states() {
        let store = StatusStore::new();
        let err = store.transition(&id("api"), running(1)).unwrap_err();
        assert_eq!(err.from, ServiceStatus::Stopped);
        assert_eq!(err.to, ServiceStatus::Running);

        store.transition(&id("api"), Transition::Starting).unwrap();
        store.transition(&id("api"), running(1)).unwrap();
        let err = store.transition(&id("api"), Transition::Starting).unwrap_err();
        assert_eq!(err.from, ServiceStatus::Running);
        assert_eq!(store.get(&id("api")).pid, Some(1));
    }

    #[test]
    fn failure_keeps_message_and_clears_pid() {
        let store = StatusStore::new();
        store.transition(&id("api"), Transition::Starting).unwrap();
        store.transition(&id("api"), running(7)).unwrap();
        let info = store
            .transition(
                &id("api"),
                Transition::Failed {
                    message: "exited with code 3".into(),
                    exit_code: Some(3),
                },
            )
            .unwrap();
        assert_eq!(info.status, ServiceStatus::Error);
        assert_eq!(info.pid, None);
        assert_eq!(info.exit_code, Some(3));
        assert_eq!(info.error.as_deref(), Some("exited with code 3"));

        let info = store.transition(&id("api"), Transition::Starting).unwrap();
        assert_eq!(info.error, None);
    }

    #[tokio::test]
    async fn late_subscriber_gets_current_state_first() {
        let store = StatusStore::new();
        store.transition(&id("api"), Transition::Starting).unwrap();
        let mut sub = store.subscribe(&id("api"));
        store.transition(&id("api"), running(9)).unwrap();

        assert_eq!(sub.recv().await.unwrap().status, ServiceStatus::Starting);
        assert_eq!(sub.recv().await.unwrap().status, ServiceStatus::Running);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn subscribers_see_every_transition_in_order() {
        let store = StatusStore::new();
        let mut first = store.subscribe(&id("api"));
        let mut second = store.subscribe(&id("api"));
        store.transition(&id("api"), Transition::Starting).unwrap();
        store.transition(&id("api"), running(3)).unwrap();
        store
            .transition(&id("api"), Transition::Stopped { exit_code: Some(0) })
            .unwrap();

        for sub in [&mut first, &mut second] {
            let mut seen = Vec::new();
            while let Some(info) = sub.try_recv() {
                seen.push(info.status);
            }
            assert_eq!(
                seen,
                vec![
                    ServiceStatus::Stopped,
                    ServiceStatus::Starting,
                    ServiceStatus::Running,
                    ServiceStatus::Stopped
                ]
            );
        }
    }

    #[test]
    fn ids_are_independent() {
        let store = StatusStore::new();
        store.transition(&id("a"), Transition::Starting).unwrap();
        assert_eq!(store.get(&id("b")).status, ServiceStatus::Stopped);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn removing_a_service_closes_subscriptions() {
        let store = StatusStore::new();
        let mut sub = store.subscribe(&id("api"));
        store.remove(&id("api"));
        assert_eq!(sub.recv().await.unwrap().status, ServiceStatus::Stopped);
        assert!(sub.recv().await.is_none());
    }
}
