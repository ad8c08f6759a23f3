//! Write path shared by the scheduler, session manager, and approval gate.
//!
//! Every write goes to the coordination store first. Persisted events are
//! then offered to the live feed without waiting; a full or closed feed
//! never stalls the writer. Feed consumers that fall behind backfill with
//! [`CoordinationStore::events_after`] and drop duplicates by event id.
//!
//! The `record*` variants commit on the blocking pool. Session code uses
//! them, since it writes once per line of agent output.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::core::{AgentSession, NewEvent, TaskNode, TransparencyEvent};
use crate::store::CoordinationStore;
use crate::util::blocking;
use crate::Result;

#[derive(Clone)]
pub struct Recorder {
    store: Arc<CoordinationStore>,
    feed: Option<mpsc::Sender<TransparencyEvent>>,
}

impl Recorder {
    pub fn new(store: Arc<CoordinationStore>) -> Self {
        Self { store, feed: None }
    }

    /// Forward persisted events to `feed`.
    pub fn with_feed(mut self, feed: mpsc::Sender<TransparencyEvent>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn store(&self) -> &Arc<CoordinationStore> {
        &self.store
    }

    pub fn persist_graph(&self, tasks: &[TaskNode]) -> Result<()> {
        for event in self.store.persist_graph(tasks)? {
            self.forward(event);
        }
        Ok(())
    }

    pub fn transition(&self, task: &TaskNode, event: NewEvent) -> Result<i64> {
        let event = self.store.transition_task(task, event)?;
        Ok(self.forward(event))
    }

    pub fn append(&self, event: NewEvent) -> Result<i64> {
        let event = self.store.append_event(event)?;
        Ok(self.forward(event))
    }

    /// [`Recorder::append`] without holding a runtime worker during the commit.
    pub async fn record(&self, event: NewEvent) -> Result<i64> {
        let store = Arc::clone(&self.store);
        let event = blocking(move || store.append_event(event)).await?;
        Ok(self.forward(event))
    }

    /// Upsert the session row and append its event, on the blocking pool.
    pub async fn record_session(&self, session: &AgentSession, event: NewEvent) -> Result<i64> {
        let store = Arc::clone(&self.store);
        let session = session.clone();
        let event = blocking(move || store.record_session(&session, event)).await?;
        Ok(self.forward(event))
    }

    fn forward(&self, event: TransparencyEvent) -> i64 {
        let id = event.id;
        if let Some(feed) = &self.feed {
            match feed.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!(event_id = id, "live feed full, event dropped"),
                Err(TrySendError::Closed(_)) => {}
            }
        }
        id
    }
}
