//! Sync sessions.
//!
//! A session ties together one peer's exchange: the pushes it makes, the
//! snapshot computed for it to pull, and the paging through that snapshot.
//! Snapshot rows live in a per-session buffer that is dropped when the session
//! ends or lapses; sessions do not survive a restart, the peer simply starts
//! over from its last acknowledged tick.

use crate::channel::ChannelRouter;
use crate::clock::{Provenance, TickSource};
use crate::config::SyncConfig;
use crate::export::MAX_PAGE_SIZE;
use crate::import::{ImportPlan, ImportReport};
use crate::record::{SnapshotDirection, SnapshotRecord, SyncRecord};
use crate::snapshot::{SnapshotBuilder, SnapshotRequest};
use crate::store::Store;
use crate::{error::Result, EntityName, Error, SessionId, Tick, Timestamp, INITIAL_SYNC_TICK};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Session metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub id: SessionId,
    pub start_time: Timestamp,
    pub last_connection_time: Timestamp,
    pub started_at_tick: Tick,
    pub pull_since: Option<Tick>,
    pub pull_until: Option<Tick>,
    pub snapshot_completed_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub errors: Vec<String>,
}

impl SyncSession {
    fn new(id: SessionId, now: Timestamp, started_at_tick: Tick) -> Self {
        Self {
            id,
            start_time: now,
            last_connection_time: now,
            started_at_tick,
            pull_since: None,
            pull_until: None,
            snapshot_completed_at: None,
            completed_at: None,
            errors: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_errored(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug)]
struct SessionState {
    session: SyncSession,
    outgoing: Vec<SnapshotRecord>,
    incoming: Vec<SnapshotRecord>,
    /// Children pushed inside incoming rows; applied with their root
    nested_incoming: Vec<SnapshotRecord>,
    next_row_id: u64,
}

impl SessionState {
    fn push_row(&mut self, mut row: SnapshotRecord) {
        self.next_row_id += 1;
        row.id = self.next_row_id;
        match row.direction {
            SnapshotDirection::Outgoing => self.outgoing.push(row),
            SnapshotDirection::Incoming => self.incoming.push(row),
        }
    }

    fn clear_buffers(&mut self) {
        self.outgoing = Vec::new();
        self.incoming = Vec::new();
        self.nested_incoming = Vec::new();
    }
}

/// Owns every live session and its snapshot buffer.
#[derive(Debug)]
pub struct SessionManager {
    store: Store,
    router: ChannelRouter,
    config: SyncConfig,
    sessions: RwLock<HashMap<SessionId, SessionState>>,
}

impl SessionManager {
    pub fn new(store: Store, config: SyncConfig) -> Self {
        let router = ChannelRouter::new(store.schema());
        Self {
            store,
            router,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Open a session, moving the clock so everything written from now on is
    /// ordered after its start.
    pub fn start_session(&self, now: Timestamp) -> SyncSession {
        let id = SessionId::new_v4();
        let started_at_tick = self.store.clock().tick_tock().tock;
        let session = SyncSession::new(id, now, started_at_tick);

        self.sessions.write().insert(
            id,
            SessionState {
                session: session.clone(),
                outgoing: Vec::new(),
                incoming: Vec::new(),
                nested_incoming: Vec::new(),
                next_row_id: 0,
            },
        );
        tracing::info!(session_id = %id, tick = started_at_tick, "sync session started");
        session
    }

    /// Check a session can still be used and refresh its connection time.
    ///
    /// A session idle for longer than the session timeout is marked errored
    /// here and refused from then on.
    pub fn connect(&self, id: SessionId, now: Timestamp) -> Result<SyncSession> {
        let mut sessions = self.sessions.write();
        let state = sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))?;
        let session = &mut state.session;

        if let Some(message) = session.errors.first() {
            return Err(Error::SessionErrored {
                id,
                message: message.clone(),
            });
        }
        if session.is_completed() {
            return Err(Error::SessionCompleted(id));
        }
        if now.saturating_sub(session.last_connection_time) > self.config.session_timeout_ms {
            let message = "sync session timed out".to_string();
            session.errors.push(message.clone());
            state.clear_buffers();
            tracing::warn!(session_id = %id, "sync session timed out");
            return Err(Error::SessionErrored { id, message });
        }

        session.last_connection_time = now;
        Ok(session.clone())
    }

    /// Look a session up without touching it.
    pub fn session(&self, id: SessionId) -> Result<SyncSession> {
        self.sessions
            .read()
            .get(&id)
            .map(|state| state.session.clone())
            .ok_or(Error::SessionNotFound(id))
    }

    /// Finish a session and drop its buffered rows.
    pub fn end_session(&self, id: SessionId, now: Timestamp) -> Result<()> {
        let mut sessions = self.sessions.write();
        let state = sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))?;
        if state.session.is_completed() {
            return Ok(());
        }
        state.session.completed_at = Some(now);
        state.clear_buffers();
        tracing::info!(
            session_id = %id,
            duration_ms = now.saturating_sub(state.session.start_time),
            "sync session ended"
        );
        Ok(())
    }

    /// Record an error against a session. Errored sessions refuse further
    /// work and their buffered rows are dropped.
    pub fn mark_errored(&self, id: SessionId, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        let mut sessions = self.sessions.write();
        let state = sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))?;
        tracing::error!(session_id = %id, error = %message, "sync session errored");
        state.session.errors.push(message);
        state.clear_buffers();
        Ok(())
    }

    /// Drop every session idle for longer than the lapse window, together
    /// with its snapshot rows. Returns how many were dropped.
    pub fn expire_lapsed(&self, now: Timestamp) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        let window = self.config.lapsed_session_ms;
        sessions.retain(|_, state| {
            now.saturating_sub(state.session.last_connection_time) <= window
        });
        let dropped = before - sessions.len();
        if dropped > 0 {
            tracing::info!(count = dropped, "dropped lapsed sync sessions");
        }
        dropped
    }

    /// Compute the session's outgoing snapshot. Returns the number of rows
    /// made available for pulling.
    ///
    /// A failed pass marks the session errored and keeps nothing; the peer
    /// must start a new session.
    pub fn snapshot_outgoing(&self, request: &SnapshotRequest, now: Timestamp) -> Result<u64> {
        if self.config.read_only {
            return Ok(0);
        }
        let id = request.session_id;
        self.connect(id, now)?;

        let builder = SnapshotBuilder::new(self.store.schema(), &self.config);
        let pass = {
            let view = self.store.begin_read();
            builder.build(&view, request)
        };
        let pass = match pass {
            Ok(pass) => pass,
            Err(err) => {
                self.mark_errored(id, err.to_string())?;
                return Err(err);
            }
        };

        {
            let mut sessions = self.sessions.write();
            let state = sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))?;
            state.outgoing = Vec::new();
            for row in pass.rows {
                state.push_row(row);
            }
            state.session.pull_since = Some(pass.since);
            state.session.pull_until = Some(pass.until);
            state.session.snapshot_completed_at = Some(now);
        }

        self.remove_echoed_changes(id)?;
        let count = self.count_outgoing(id)?;
        tracing::info!(
            session_id = %id,
            count,
            since = pass.since,
            until = pass.until,
            "snapshot complete"
        );
        Ok(count)
    }

    /// A page of the session's outgoing rows with ids above `from_id`.
    pub fn outgoing_changes(
        &self,
        id: SessionId,
        from_id: u64,
        limit: usize,
    ) -> Result<Vec<SnapshotRecord>> {
        let sessions = self.sessions.read();
        let state = sessions.get(&id).ok_or(Error::SessionNotFound(id))?;
        if state.session.snapshot_completed_at.is_none() {
            return Err(Error::SnapshotNotReady(id));
        }
        Ok(state
            .outgoing
            .iter()
            .filter(|row| row.id > from_id)
            .take(limit.clamp(1, MAX_PAGE_SIZE))
            .cloned()
            .collect())
    }

    /// Number of outgoing rows waiting to be pulled.
    pub fn count_outgoing(&self, id: SessionId) -> Result<u64> {
        let sessions = self.sessions.read();
        let state = sessions.get(&id).ok_or(Error::SessionNotFound(id))?;
        if state.session.snapshot_completed_at.is_none() {
            return Err(Error::SnapshotNotReady(id));
        }
        Ok(state.outgoing.len() as u64)
    }

    /// Buffer records pushed by the peer. Returns how many were buffered.
    pub fn add_incoming_changes(
        &self,
        id: SessionId,
        record_type: &str,
        records: Vec<SyncRecord>,
        now: Timestamp,
    ) -> Result<usize> {
        let plan = ImportPlan::compile(self.store.schema(), self.router.resolve(record_type)?)?;
        self.connect(id, now)?;
        let children = plan.nested_records(&records);

        let mut sessions = self.sessions.write();
        let state = sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))?;
        let count = records.len();
        for record in records {
            state.push_row(incoming_row(id, record_type, record));
        }
        for (entity, child) in children {
            state.nested_incoming.push(incoming_row(id, &entity, child));
        }
        tracing::debug!(session_id = %id, entity = %record_type, count, "buffered incoming changes");
        Ok(count)
    }

    /// Apply every buffered incoming row in one write transaction.
    ///
    /// A conflict anywhere aborts the whole push and marks the session
    /// errored; malformed records are only reported.
    pub fn persist_incoming_changes(&self, id: SessionId, now: Timestamp) -> Result<ImportReport> {
        self.connect(id, now)?;
        let incoming = {
            let sessions = self.sessions.read();
            let state = sessions.get(&id).ok_or(Error::SessionNotFound(id))?;
            state.incoming.clone()
        };

        let mut batches: Vec<(EntityName, Vec<SyncRecord>)> = Vec::new();
        for row in &incoming {
            let record = row.to_sync_record();
            match batches.iter_mut().find(|(entity, _)| *entity == row.record_type) {
                Some((_, records)) => records.push(record),
                None => batches.push((row.record_type.clone(), vec![record])),
            }
        }

        let schema = self.store.schema();
        let mut txn = self.store.begin_write(Provenance::Synced);
        let mut report = ImportReport::default();
        for (entity, records) in &batches {
            let applied = self
                .router
                .resolve(entity)
                .and_then(|channel| ImportPlan::compile(schema, channel))
                .and_then(|plan| plan.apply(schema, &mut txn, records, &self.config, now));
            match applied {
                Ok(batch) => report.merge(batch),
                Err(err) => {
                    drop(txn);
                    self.mark_errored(id, err.to_string())?;
                    return Err(err);
                }
            }
        }
        report.tick = txn.commit();

        if let Some(tick) = report.tick {
            let mut sessions = self.sessions.write();
            if let Some(state) = sessions.get_mut(&id) {
                for row in state.incoming.iter_mut().chain(&mut state.nested_incoming) {
                    row.saved_at_tick = tick;
                }
            }
        }
        tracing::info!(
            session_id = %id,
            applied = report.outcomes.len(),
            rejected = report.rejected.len(),
            "persisted incoming changes"
        );
        Ok(report)
    }

    /// Drop outgoing rows for records the same session pushed, so a peer is
    /// not sent its own changes back. Returns how many were dropped.
    pub fn remove_echoed_changes(&self, id: SessionId) -> Result<usize> {
        let mut sessions = self.sessions.write();
        let state = sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))?;
        let pushed: HashSet<(&str, &str)> = state
            .incoming
            .iter()
            .chain(&state.nested_incoming)
            .map(|row| (row.record_type.as_str(), row.record_id.as_str()))
            .collect();
        let before = state.outgoing.len();
        let mut outgoing = std::mem::take(&mut state.outgoing);
        outgoing.retain(|row| !pushed.contains(&(row.record_type.as_str(), row.record_id.as_str())));
        let removed = before - outgoing.len();
        state.outgoing = outgoing;
        Ok(removed)
    }

    /// Ids of every live session.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }

    /// Rows buffered for a record, pushed or outgoing.
    pub fn buffered_rows(&self, id: SessionId, record_type: &str, record_id: &str) -> usize {
        self.sessions.read().get(&id).map_or(0, |state| {
            state
                .outgoing
                .iter()
                .chain(&state.incoming)
                .chain(&state.nested_incoming)
                .filter(|row| row.record_type == record_type && row.record_id == record_id)
                .count()
        })
    }
}

fn incoming_row(session_id: SessionId, record_type: &str, record: SyncRecord) -> SnapshotRecord {
    SnapshotRecord {
        id: 0,
        session_id,
        direction: SnapshotDirection::Incoming,
        is_deleted: record.is_deleted,
        record_type: record_type.to_string(),
        record_id: record.id().unwrap_or_default().to_string(),
        saved_at_tick: INITIAL_SYNC_TICK,
        data: record.data,
    }
}
