use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock};

use crate::credential::unix_ms;
use crate::fsutil::write_atomic;
use crate::{StorageError, StorageResult};

const REDACTED: &str = "[REDACTED]";
const REDACTED_HEADERS: [&str; 2] = ["authorization", "cookie"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub model: String,
    pub project_id: String,
    pub success: bool,
    pub status_code: u16,
    pub message: String,
    pub duration_ms: u64,
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<LogDetail>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
}

impl RequestSnapshot {
    /// Header values for `authorization` and `cookie` are masked before the
    /// snapshot ever reaches the store.
    pub fn new<'a>(
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
        body: Option<JsonValue>,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, value)| {
                let lowered = name.to_ascii_lowercase();
                let value = if REDACTED_HEADERS.contains(&lowered.as_str()) {
                    REDACTED.to_string()
                } else {
                    value.to_string()
                };
                (lowered, value)
            })
            .collect();
        Self { headers, body }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseSnapshot {
    Body { body: JsonValue },
    Stream {
        events: Vec<JsonValue>,
        summary: StreamSummary,
    },
}

impl ResponseSnapshot {
    pub fn stream(events: Vec<JsonValue>) -> Self {
        let summary = StreamSummary::derive(&events);
        ResponseSnapshot::Stream { events, summary }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub text: String,
    pub thinking: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<JsonValue>,
}

impl StreamSummary {
    /// Events are the flat records the stream engine collects:
    /// `{"content": …}`, `{"thinking": …}` and `{"tool_calls": […]}`.
    /// Text fields concatenate; the last tool_calls event wins.
    pub fn derive(events: &[JsonValue]) -> Self {
        let mut summary = StreamSummary::default();
        for event in events {
            if let Some(content) = event.get("content").and_then(|v| v.as_str()) {
                summary.text.push_str(content);
            }
            if let Some(thinking) = event.get("thinking").and_then(|v| v.as_str()) {
                summary.thinking.push_str(thinking);
            }
            if let Some(tool_calls) = event.get("tool_calls") {
                summary.tool_calls = Some(tool_calls.clone());
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewLogEntry {
    pub model: String,
    pub project_id: String,
    pub success: bool,
    pub status_code: u16,
    pub message: String,
    pub duration_ms: u64,
    pub method: String,
    pub path: String,
    pub detail: Option<LogDetail>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectUsage {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub last_used_at: i64,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WindowUsage {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub last_used_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LogFile {
    logs: Vec<LogEntry>,
    max_items: usize,
    retention_days: u32,
}

#[derive(Debug, Default)]
struct LogState {
    entries: VecDeque<LogEntry>,
    next_id: u64,
}

/// Append-only capped request log; the persistent source of truth for
/// per-project usage. Counters here are derived by scanning retained entries.
pub struct RequestLog {
    path: PathBuf,
    max_items: usize,
    retention: Duration,
    state: RwLock<LogState>,
    file_lock: Mutex<()>,
}

impl RequestLog {
    pub fn new(path: PathBuf, max_items: usize, retention_days: u32) -> Self {
        Self {
            path,
            max_items: max_items.max(1),
            retention: Duration::from_secs(u64::from(retention_days) * 86_400),
            state: RwLock::new(LogState::default()),
            file_lock: Mutex::new(()),
        }
    }

    pub fn retention_days(&self) -> u32 {
        (self.retention.as_secs() / 86_400) as u32
    }

    pub async fn load(&self) -> StorageResult<()> {
        let _io = self.file_lock.lock().await;
        let file = match std::fs::read(&self.path) {
            Ok(bytes) => {
                serde_json::from_slice::<LogFile>(&bytes).map_err(|err| StorageError::Corrupt {
                    path: self.path.display().to_string(),
                    message: err.to_string(),
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LogFile::default(),
            Err(err) => return Err(err.into()),
        };
        let next_id = file.logs.iter().map(|entry| entry.id + 1).max().unwrap_or(1);
        let mut state = self.state.write().await;
        state.entries = file.logs.into();
        state.next_id = next_id.max(1);
        Ok(())
    }

    /// Assigns the id, enforces retention and capacity, persists atomically.
    pub async fn append(&self, new_entry: NewLogEntry) -> StorageResult<u64> {
        let now = unix_ms();
        let id;
        {
            let mut state = self.state.write().await;
            id = state.next_id;
            state.next_id += 1;
            state.entries.push_back(LogEntry {
                id,
                timestamp: now,
                model: new_entry.model,
                project_id: new_entry.project_id,
                success: new_entry.success,
                status_code: new_entry.status_code,
                message: new_entry.message,
                duration_ms: new_entry.duration_ms,
                method: new_entry.method,
                path: new_entry.path,
                detail: new_entry.detail,
            });
            let cutoff = now - self.retention.as_millis() as i64;
            while let Some(front) = state.entries.front() {
                if front.timestamp < cutoff || state.entries.len() > self.max_items {
                    state.entries.pop_front();
                } else {
                    break;
                }
            }
        }
        self.persist().await?;
        Ok(id)
    }

    /// Newest first, details stripped.
    pub async fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let cutoff = self.retention_cutoff();
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .rev()
            .filter(|entry| entry.timestamp >= cutoff)
            .take(limit)
            .map(|entry| LogEntry {
                detail: None,
                ..entry.clone()
            })
            .collect()
    }

    pub async fn detail(&self, id: u64) -> Option<LogEntry> {
        let state = self.state.read().await;
        state.entries.iter().find(|entry| entry.id == id).cloned()
    }

    pub async fn clear(&self) -> StorageResult<()> {
        {
            let mut state = self.state.write().await;
            state.entries.clear();
        }
        self.persist().await
    }

    /// Per-project totals over the full retained window.
    pub async fn usage_summary(&self) -> BTreeMap<String, ProjectUsage> {
        let cutoff = self.retention_cutoff();
        let state = self.state.read().await;
        let mut out: BTreeMap<String, ProjectUsage> = BTreeMap::new();
        for entry in state.entries.iter().filter(|e| e.timestamp >= cutoff) {
            let usage = out.entry(entry.project_id.clone()).or_default();
            usage.total += 1;
            if entry.success {
                usage.success += 1;
            } else {
                usage.failed += 1;
            }
            usage.last_used_at = usage.last_used_at.max(entry.timestamp);
            if !entry.model.is_empty() && !usage.models.contains(&entry.model) {
                usage.models.push(entry.model.clone());
            }
        }
        out
    }

    /// Per-project counts over the trailing `window`.
    pub async fn usage_within(&self, window: Duration) -> BTreeMap<String, WindowUsage> {
        let cutoff = unix_ms() - window.as_millis() as i64;
        let state = self.state.read().await;
        let mut out: BTreeMap<String, WindowUsage> = BTreeMap::new();
        for entry in state.entries.iter().filter(|e| e.timestamp >= cutoff) {
            let usage = out.entry(entry.project_id.clone()).or_default();
            usage.total += 1;
            if entry.success {
                usage.success += 1;
            } else {
                usage.failed += 1;
            }
            usage.last_used_at = usage.last_used_at.max(entry.timestamp);
        }
        out
    }

    fn retention_cutoff(&self) -> i64 {
        unix_ms() - self.retention.as_millis() as i64
    }

    /// Serialize under the file lock, reading the state fresh so racing
    /// appends never write an older snapshot over a newer one.
    async fn persist(&self) -> StorageResult<()> {
        let _io = self.file_lock.lock().await;
        let logs = {
            let state = self.state.read().await;
            state.entries.iter().cloned().collect::<Vec<_>>()
        };
        let file = LogFile {
            logs,
            max_items: self.max_items,
            retention_days: self.retention_days(),
        };
        let body = serde_json::to_vec(&file)?;
        write_atomic(&self.path, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_in(dir: &tempfile::TempDir, max_items: usize) -> RequestLog {
        RequestLog::new(dir.path().join("request_log.json"), max_items, 7)
    }

    fn entry(model: &str, project: &str, success: bool) -> NewLogEntry {
        NewLogEntry {
            model: model.to_string(),
            project_id: project.to_string(),
            success,
            status_code: if success { 200 } else { 500 },
            message: String::new(),
            duration_ms: 12,
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            detail: None,
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_capacity_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir, 3);
        for i in 0..5 {
            let id = log.append(entry("m", "p", true)).await.unwrap();
            assert_eq!(id, i + 1);
        }
        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 3);
        // Newest first; the dropped entries are the oldest by id.
        assert_eq!(recent[0].id, 5);
        assert_eq!(recent[2].id, 3);
    }

    #[tokio::test]
    async fn recent_strips_detail_but_get_detail_keeps_it() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir, 10);
        let mut with_detail = entry("m", "p", true);
        with_detail.detail = Some(LogDetail {
            request: Some(RequestSnapshot::new(
                [("Authorization", "Bearer sk-live"), ("x-test", "1")],
                None,
            )),
            response: None,
        });
        let id = log.append(with_detail).await.unwrap();

        assert!(log.recent(1).await[0].detail.is_none());
        let detail = log.detail(id).await.unwrap().detail.unwrap();
        let headers = &detail.request.unwrap().headers;
        assert_eq!(headers.get("authorization").unwrap(), "[REDACTED]");
        assert_eq!(headers.get("x-test").unwrap(), "1");
    }

    #[tokio::test]
    async fn usage_summary_counts_per_project() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir, 100);
        log.append(entry("gemini-2.5-flash", "p1", true)).await.unwrap();
        log.append(entry("gemini-2.5-pro", "p1", false)).await.unwrap();
        log.append(entry("gemini-2.5-flash", "p2", true)).await.unwrap();

        let summary = log.usage_summary().await;
        let p1 = &summary["p1"];
        assert_eq!(p1.total, 2);
        assert_eq!(p1.success, 1);
        assert_eq!(p1.failed, 1);
        assert_eq!(p1.models.len(), 2);
        assert_eq!(summary["p2"].total, 1);

        let window = log.usage_within(Duration::from_secs(3600)).await;
        assert_eq!(window["p1"].total, 2);
    }

    #[tokio::test]
    async fn clear_truncates_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir, 10);
        log.append(entry("m", "p", true)).await.unwrap();
        log.clear().await.unwrap();
        assert!(log.recent(10).await.is_empty());

        let reopened = log_in(&dir, 10);
        reopened.load().await.unwrap();
        assert!(reopened.recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn reload_continues_id_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir, 10);
        log.append(entry("m", "p", true)).await.unwrap();
        log.append(entry("m", "p", true)).await.unwrap();

        let reopened = log_in(&dir, 10);
        reopened.load().await.unwrap();
        let id = reopened.append(entry("m", "p", true)).await.unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn stream_summary_concatenates_and_takes_last_tool_calls() {
        let events = vec![
            serde_json::json!({"thinking": "A"}),
            serde_json::json!({"content": "B"}),
            serde_json::json!({"content": "C"}),
            serde_json::json!({"tool_calls": [{"id": "t1"}]}),
            serde_json::json!({"tool_calls": [{"id": "t2"}]}),
        ];
        let summary = StreamSummary::derive(&events);
        assert_eq!(summary.text, "BC");
        assert_eq!(summary.thinking, "A");
        assert_eq!(
            summary.tool_calls.unwrap()[0]["id"].as_str().unwrap(),
            "t2"
        );
    }
}
