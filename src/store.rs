//! Durable coordination store backed by SQLite.
//!
//! Holds tasks, dependency edges, agent sessions, and the append-only
//! transparency event log. Every status transition is written in the same
//! transaction as its event, so the log and the authoritative status cannot
//! diverge.
//!
//! The database runs in WAL mode. All writes go through a single writer
//! connection; reads open their own read-only connection and can proceed
//! while a write is in flight.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row, Transaction};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DEFAULT_EVENT_PAGE_LIMIT;
use crate::core::{
    kinds, AgentRole, AgentSession, EventLevel, EventSource, NewEvent, SessionId, SessionMetrics,
    SessionStatus, TaskId, TaskMetrics, TaskNode, TaskStatus, TransparencyEvent,
};
use crate::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    agent_type TEXT NOT NULL,
    dependencies_json TEXT NOT NULL DEFAULT '[]',
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    assigned_agent TEXT,
    result TEXT,
    metrics_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    assigned_at TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    depends_on TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    PRIMARY KEY (task_id, depends_on)
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    capabilities_json TEXT NOT NULL DEFAULT '[]',
    session_id TEXT NOT NULL,
    status TEXT NOT NULL,
    current_task TEXT,
    workspace_path TEXT NOT NULL,
    branch_name TEXT NOT NULL,
    pid INTEGER,
    metrics_json TEXT NOT NULL DEFAULT '{}',
    registered_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

CREATE TABLE IF NOT EXISTS transparency_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    session_id TEXT,
    agent_id TEXT,
    task_id TEXT,
    source TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    tool_name TEXT,
    duration INTEGER,
    success INTEGER,
    error TEXT,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_session ON transparency_events(session_id);
CREATE INDEX IF NOT EXISTS idx_events_task ON transparency_events(task_id);

CREATE TRIGGER IF NOT EXISTS tasks_touch_updated_at
AFTER UPDATE ON tasks FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE tasks SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS agents_touch_updated_at
AFTER UPDATE ON agents FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE agents SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS transparency_events_no_update
BEFORE UPDATE ON transparency_events
BEGIN
    SELECT RAISE(ABORT, 'transparency events are append-only');
END;

CREATE TRIGGER IF NOT EXISTS transparency_events_no_delete
BEFORE DELETE ON transparency_events
BEGIN
    SELECT RAISE(ABORT, 'transparency events are append-only');
END;
"#;

const EVENT_COLUMNS: &str = "id, type, session_id, task_id, source, level, message, tool_name, \
     duration, success, error, metadata_json, timestamp";

const TASK_COLUMNS: &str = "id, description, agent_type, dependencies_json, priority, status, \
     metadata_json, assigned_agent, result, metrics_json, created_at, updated_at, assigned_at, \
     completed_at";

/// Per-task line in a detailed health report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub status: TaskStatus,
    pub agent_role: AgentRole,
    pub priority: i32,
    pub attempts: u32,
    pub retries: u32,
    pub assigned_session: Option<SessionId>,
    pub error: Option<String>,
}

/// Aggregate task and queue health.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueHealth {
    pub total: usize,
    pub counts: BTreeMap<TaskStatus, usize>,
    pub active_sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskSummary>>,
}

impl QueueHealth {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

/// Columns of a task row that hold JSON outside the fixed schema.
#[derive(Debug, Default, serde::Deserialize, Serialize)]
struct TaskMetadata {
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub struct CoordinationStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    page_limit: usize,
}

impl CoordinationStore {
    /// Open (creating if needed) the store at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "coordination store opened");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
            page_limit: DEFAULT_EVENT_PAGE_LIMIT,
        })
    }

    /// Cap on the number of events any single query returns.
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_limit(&self) -> usize {
        self.page_limit
    }

    fn reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Run `f` inside one write transaction. Any failure is a `StoreWrite`.
    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| Error::StoreWrite("writer connection poisoned".to_string()))?;
        let tx = conn.transaction().map_err(store_write)?;
        let value = f(&tx).map_err(|e| match e {
            Error::StoreWrite(_) | Error::TaskNotFound(_) => e,
            other => Error::StoreWrite(other.to_string()),
        })?;
        tx.commit().map_err(store_write)?;
        Ok(value)
    }

    // ========== Writes ==========

    /// Persist a validated batch of new tasks with their dependency edges.
    ///
    /// All or nothing: if any row fails (for example an id that already
    /// exists) the batch is rolled back.
    pub fn persist_graph(&self, tasks: &[TaskNode]) -> Result<Vec<TransparencyEvent>> {
        let events = self.write(|tx| {
            for task in tasks {
                insert_task(tx, task)?;
            }
            for task in tasks {
                for dep in &task.dependencies {
                    tx.execute(
                        "INSERT INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
                        params![task.id.as_str(), dep.as_str()],
                    )
                    .map_err(store_write)?;
                }
            }
            let mut events = Vec::with_capacity(tasks.len());
            for task in tasks {
                let event = NewEvent::new(
                    EventSource::Decomposer,
                    kinds::TASK_CREATED,
                    format!("task {} created for {}", task.id, task.agent_role),
                )
                .task(&task.id)
                .meta("status", task.status.as_str())
                .meta("agent_role", task.agent_role.as_str())
                .meta("priority", task.priority);
                events.push(insert_event(tx, event)?);
            }
            Ok(events)
        })?;
        debug!(tasks = tasks.len(), "task graph persisted");
        Ok(events)
    }

    /// Write a task's current state together with the event describing the
    /// transition.
    pub fn transition_task(&self, task: &TaskNode, event: NewEvent) -> Result<TransparencyEvent> {
        self.write(|tx| {
            let metadata = task_metadata_json(task)?;
            let changed = tx
                .execute(
                    "UPDATE tasks SET status = ?2, priority = ?3, metadata_json = ?4,
                         assigned_agent = ?5, result = ?6, metrics_json = ?7,
                         updated_at = ?8, assigned_at = ?9, completed_at = ?10
                     WHERE id = ?1",
                    params![
                        task.id.as_str(),
                        task.status.as_str(),
                        task.priority,
                        metadata,
                        task.assigned_session.as_ref().map(SessionId::as_str),
                        task.result.as_ref().map(|v| v.to_string()),
                        serde_json::to_string(&task.metrics)?,
                        task.updated_at.to_rfc3339(),
                        task.assigned_at.map(|t| t.to_rfc3339()),
                        task.completed_at.map(|t| t.to_rfc3339()),
                    ],
                )
                .map_err(store_write)?;
            if changed == 0 {
                return Err(Error::TaskNotFound(task.id.to_string()));
            }
            insert_event(tx, event)
        })
    }

    /// Insert or update a session row together with its event.
    pub fn record_session(
        &self,
        session: &AgentSession,
        event: NewEvent,
    ) -> Result<TransparencyEvent> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO agents (id, type, capabilities_json, session_id, status, current_task,
                     workspace_path, branch_name, pid, metrics_json, registered_at, updated_at)
                 VALUES (?1, ?2, ?3, ?1, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     current_task = excluded.current_task,
                     pid = excluded.pid,
                     metrics_json = excluded.metrics_json,
                     updated_at = excluded.updated_at",
                params![
                    session.id.as_str(),
                    session.agent_role.as_str(),
                    serde_json::to_string(&[session.agent_role.as_str()])?,
                    session.status.as_str(),
                    session.current_task_id.as_ref().map(TaskId::as_str),
                    session.workspace_path.to_string_lossy().to_string(),
                    session.branch_name,
                    session.pid,
                    serde_json::to_string(&session.metrics)?,
                    session.registered_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )
            .map_err(store_write)?;
            insert_event(tx, event)
        })
    }

    /// Append a standalone event (agent output, approval request, ...).
    pub fn append_event(&self, event: NewEvent) -> Result<TransparencyEvent> {
        self.write(|tx| insert_event(tx, event))
    }

    // ========== Reads ==========

    /// The most recent events in ascending id order, optionally for one
    /// session. `limit` is clamped to the page limit.
    pub fn recent_events(
        &self,
        session: Option<&SessionId>,
        limit: usize,
    ) -> Result<Vec<TransparencyEvent>> {
        let limit = self.clamp(limit);
        let conn = self.reader()?;
        let mut events = match session {
            Some(session) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM transparency_events
                     WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![session.as_str(), limit], read_event_row)?;
                collect_events(rows)?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM transparency_events ORDER BY id DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], read_event_row)?;
                collect_events(rows)?
            }
        };
        events.reverse();
        Ok(events)
    }

    /// Events with an id greater than `after_id`, ascending. Used to backfill
    /// a live feed that missed messages.
    pub fn events_after(&self, after_id: i64, limit: usize) -> Result<Vec<TransparencyEvent>> {
        let limit = self.clamp(limit);
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM transparency_events WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![after_id, limit], read_event_row)?;
        collect_events(rows)
    }

    /// The whole event log in id order, for replay.
    pub fn all_events(&self) -> Result<Vec<TransparencyEvent>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM transparency_events ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], read_event_row)?;
        collect_events(rows)
    }

    pub fn events_for_task(&self, task_id: &TaskId) -> Result<Vec<TransparencyEvent>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM transparency_events WHERE task_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![task_id.as_str()], read_event_row)?;
        collect_events(rows)
    }

    /// Every persisted task, in insertion order.
    pub fn load_tasks(&self) -> Result<Vec<TaskNode>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY rowid"))?;
        let rows = stmt.query_map([], read_task_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn load_task(&self, id: &TaskId) -> Result<TaskNode> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id.as_str()], read_task_row)?;
        match rows.next() {
            Some(row) => row?.into_task(),
            None => Err(Error::TaskNotFound(id.to_string())),
        }
    }

    /// Dependency edges as stored, `(task, depends_on)`.
    pub fn dependency_edges(&self) -> Result<Vec<(TaskId, TaskId)>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, depends_on FROM task_dependencies ORDER BY task_id, depends_on",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                TaskId(row.get::<_, String>(0)?),
                TaskId(row.get::<_, String>(1)?),
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn load_sessions(&self) -> Result<Vec<AgentSession>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, status, current_task, workspace_path, branch_name, pid,
                    metrics_json, registered_at, updated_at
             FROM agents ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RawSession {
                id: row.get(0)?,
                agent_type: row.get(1)?,
                status: row.get(2)?,
                current_task: row.get(3)?,
                workspace_path: row.get(4)?,
                branch_name: row.get(5)?,
                pid: row.get(6)?,
                metrics_json: row.get(7)?,
                registered_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        })?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.into_session()?);
        }
        Ok(sessions)
    }

    /// Counts by status, optionally with one line per task.
    pub fn queue_health(&self, detail: bool) -> Result<QueueHealth> {
        let conn = self.reader()?;
        let mut health = QueueHealth::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            let status: TaskStatus = status.parse().map_err(Error::Validation)?;
            health.counts.insert(status, count as usize);
            health.total += count as usize;
        }

        health.active_sessions = conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE status != 'terminated'",
            [],
            |row| row.get::<_, i64>(0),
        )? as usize;

        if detail {
            drop(stmt);
            health.tasks = Some(
                self.load_tasks()?
                    .into_iter()
                    .map(|t| TaskSummary {
                        id: t.id,
                        status: t.status,
                        agent_role: t.agent_role,
                        priority: t.priority,
                        attempts: t.metrics.attempts,
                        retries: t.metrics.retries,
                        assigned_session: t.assigned_session,
                        error: t.error,
                    })
                    .collect(),
            );
        }
        Ok(health)
    }

    fn clamp(&self, limit: usize) -> i64 {
        limit.clamp(1, self.page_limit) as i64
    }
}

impl std::fmt::Debug for CoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationStore")
            .field("path", &self.path)
            .field("page_limit", &self.page_limit)
            .finish()
    }
}

fn store_write(e: rusqlite::Error) -> Error {
    warn!(error = %e, "store write failed");
    Error::StoreWrite(e.to_string())
}

fn task_metadata_json(task: &TaskNode) -> Result<String> {
    Ok(serde_json::to_string(&TaskMetadata {
        tags: task.tags.clone(),
        error: task.error.clone(),
    })?)
}

fn insert_task(tx: &Transaction<'_>, task: &TaskNode) -> Result<()> {
    let deps: Vec<&str> = task.dependencies.iter().map(TaskId::as_str).collect();
    tx.execute(
        "INSERT INTO tasks (id, description, agent_type, dependencies_json, priority, status,
             metadata_json, assigned_agent, result, metrics_json, created_at, updated_at,
             assigned_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            task.id.as_str(),
            task.description,
            task.agent_role.as_str(),
            serde_json::to_string(&deps)?,
            task.priority,
            task.status.as_str(),
            task_metadata_json(task)?,
            task.assigned_session.as_ref().map(SessionId::as_str),
            task.result.as_ref().map(|v| v.to_string()),
            serde_json::to_string(&task.metrics)?,
            task.created_at.to_rfc3339(),
            task.updated_at.to_rfc3339(),
            task.assigned_at.map(|t| t.to_rfc3339()),
            task.completed_at.map(|t| t.to_rfc3339()),
        ],
    )
    .map_err(store_write)?;
    Ok(())
}

fn insert_event(tx: &Transaction<'_>, event: NewEvent) -> Result<TransparencyEvent> {
    let now = Utc::now();
    tx.execute(
        "INSERT INTO transparency_events (type, session_id, agent_id, task_id, source, level,
             message, tool_name, duration, success, error, metadata_json, timestamp)
         VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            event.event_type,
            event.session_id.as_ref().map(SessionId::as_str),
            event.task_id.as_ref().map(TaskId::as_str),
            event.source.as_str(),
            event.level.as_str(),
            event.message,
            event.tool_name,
            event.duration_ms.map(|d| d as i64),
            event.success,
            event.error,
            serde_json::to_string(&event.metadata)?,
            now.to_rfc3339(),
        ],
    )
    .map_err(store_write)?;

    Ok(TransparencyEvent {
        id: tx.last_insert_rowid(),
        session_id: event.session_id,
        task_id: event.task_id,
        event_time: now,
        source: event.source,
        level: event.level,
        event_type: event.event_type,
        message: event.message,
        tool_name: event.tool_name,
        duration_ms: event.duration_ms,
        success: event.success,
        error: event.error,
        metadata: event.metadata,
    })
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("bad timestamp {:?}: {}", value, e)))
}

fn parse_opt_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}

struct RawEvent {
    id: i64,
    event_type: String,
    session_id: Option<String>,
    task_id: Option<String>,
    source: String,
    level: String,
    message: String,
    tool_name: Option<String>,
    duration: Option<i64>,
    success: Option<bool>,
    error: Option<String>,
    metadata_json: String,
    timestamp: String,
}

fn read_event_row(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        session_id: row.get(2)?,
        task_id: row.get(3)?,
        source: row.get(4)?,
        level: row.get(5)?,
        message: row.get(6)?,
        tool_name: row.get(7)?,
        duration: row.get(8)?,
        success: row.get(9)?,
        error: row.get(10)?,
        metadata_json: row.get(11)?,
        timestamp: row.get(12)?,
    })
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<RawEvent>>,
) -> Result<Vec<TransparencyEvent>> {
    let mut events = Vec::new();
    for row in rows {
        events.push(row?.into_event()?);
    }
    Ok(events)
}

impl RawEvent {
    fn into_event(self) -> Result<TransparencyEvent> {
        Ok(TransparencyEvent {
            id: self.id,
            session_id: self.session_id.map(SessionId),
            task_id: self.task_id.map(TaskId),
            event_time: parse_time(&self.timestamp)?,
            source: EventSource::parse(&self.source)
                .ok_or_else(|| Error::Validation(format!("unknown event source: {}", self.source)))?,
            level: EventLevel::parse(&self.level)
                .ok_or_else(|| Error::Validation(format!("unknown event level: {}", self.level)))?,
            event_type: self.event_type,
            message: self.message,
            tool_name: self.tool_name,
            duration_ms: self.duration.map(|d| d.max(0) as u64),
            success: self.success,
            error: self.error,
            metadata: serde_json::from_str(&self.metadata_json)?,
        })
    }
}

struct RawTask {
    id: String,
    description: String,
    agent_type: String,
    dependencies_json: String,
    priority: i32,
    status: String,
    metadata_json: String,
    assigned_agent: Option<String>,
    result: Option<String>,
    metrics_json: String,
    created_at: String,
    updated_at: String,
    assigned_at: Option<String>,
    completed_at: Option<String>,
}

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        description: row.get(1)?,
        agent_type: row.get(2)?,
        dependencies_json: row.get(3)?,
        priority: row.get(4)?,
        status: row.get(5)?,
        metadata_json: row.get(6)?,
        assigned_agent: row.get(7)?,
        result: row.get(8)?,
        metrics_json: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        assigned_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

impl RawTask {
    fn into_task(self) -> Result<TaskNode> {
        let metadata: TaskMetadata = serde_json::from_str(&self.metadata_json)?;
        let dependencies: BTreeSet<TaskId> = serde_json::from_str(&self.dependencies_json)?;
        let metrics: TaskMetrics = serde_json::from_str(&self.metrics_json)?;
        Ok(TaskNode {
            id: TaskId(self.id),
            description: self.description,
            agent_role: self.agent_type.parse().map_err(Error::Validation)?,
            dependencies,
            priority: self.priority,
            status: self.status.parse().map_err(Error::Validation)?,
            tags: metadata.tags,
            assigned_session: self.assigned_agent.map(SessionId),
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error: metadata.error,
            metrics,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            assigned_at: parse_opt_time(self.assigned_at)?,
            completed_at: parse_opt_time(self.completed_at)?,
        })
    }
}

struct RawSession {
    id: String,
    agent_type: String,
    status: String,
    current_task: Option<String>,
    workspace_path: String,
    branch_name: String,
    pid: Option<u32>,
    metrics_json: String,
    registered_at: String,
    updated_at: String,
}

impl RawSession {
    fn into_session(self) -> Result<AgentSession> {
        let metrics: SessionMetrics = serde_json::from_str(&self.metrics_json)?;
        let status: SessionStatus = self.status.parse().map_err(Error::Validation)?;
        Ok(AgentSession {
            id: SessionId(self.id),
            agent_role: self.agent_type.parse().map_err(Error::Validation)?,
            workspace_path: PathBuf::from(self.workspace_path),
            branch_name: self.branch_name,
            status,
            current_task_id: self.current_task.map(TaskId),
            pid: self.pid,
            metrics,
            registered_at: parse_time(&self.registered_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}
