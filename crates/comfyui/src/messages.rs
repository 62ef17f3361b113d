//! Typed views of the ComfyUI `/queue` and `/history` payloads.
//!
//! `GET /queue` returns `{"queue_running": [...], "queue_pending": [...]}`
//! where each item is `[number, prompt_id, prompt, extra_data, outputs]`.
//! `GET /history/{id}` returns `{}` until the prompt finishes, then
//! `{"<id>": {"outputs": {...}, "status": {...}}}`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

/// Transient view of the server queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueState {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl QueueState {
    pub fn contains(&self, prompt_id: &str) -> bool {
        self.running.iter().chain(&self.pending).any(|id| id == prompt_id)
    }
}

/// State of one prompt as reported by `/history`.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryStatus {
    /// Not present in the history yet.
    Pending,
    /// Finished; the output images written by the server.
    Completed(Vec<PathBuf>),
    /// Finished with an execution error.
    Failed(String),
}

impl HistoryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Deserialize)]
struct QueuePayload {
    #[serde(default)]
    queue_running: Vec<Vec<Value>>,
    #[serde(default)]
    queue_pending: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    outputs: serde_json::Map<String, Value>,
    #[serde(default)]
    status: Option<HistoryEntryStatus>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntryStatus {
    #[serde(default)]
    status_str: Option<String>,
    #[serde(default)]
    completed: bool,
    /// `[[event_name, {details}], ...]`
    #[serde(default)]
    messages: Vec<(String, Value)>,
}

#[derive(Debug, Deserialize)]
struct ImageOutput {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(default, rename = "type")]
    kind: String,
}

/// Parse a `GET /queue` payload.
pub fn parse_queue(value: &Value) -> Result<QueueState, serde_json::Error> {
    let payload = QueuePayload::deserialize(value)?;
    let ids = |items: Vec<Vec<Value>>| -> Vec<String> {
        items
            .into_iter()
            .filter_map(|item| item.get(1).and_then(Value::as_str).map(str::to_string))
            .collect()
    };
    Ok(QueueState {
        running: ids(payload.queue_running),
        pending: ids(payload.queue_pending),
    })
}

/// Parse a `GET /history/{prompt_id}` payload.
///
/// Output images of type `output` are resolved against `output_dir`, in
/// node id order.
pub fn parse_history(
    prompt_id: &str,
    value: &Value,
    output_dir: &Path,
) -> Result<HistoryStatus, serde_json::Error> {
    let Some(entry) = value.get(prompt_id) else {
        return Ok(HistoryStatus::Pending);
    };
    let entry = HistoryEntry::deserialize(entry)?;

    if let Some(status) = &entry.status {
        if status.status_str.as_deref() == Some("error") {
            return Ok(HistoryStatus::Failed(error_message(status)));
        }
        if status.status_str.is_none() && !status.completed {
            return Ok(HistoryStatus::Pending);
        }
    }

    let mut nodes: Vec<(&String, &Value)> = entry.outputs.iter().collect();
    nodes.sort_by(|a, b| natural_id_cmp(a.0, b.0));

    let mut artifacts = Vec::new();
    for (_, node_output) in nodes {
        let Some(images) = node_output.get("images") else {
            continue;
        };
        for image in Vec::<ImageOutput>::deserialize(images)? {
            if image.kind != "output" {
                continue;
            }
            let mut path = output_dir.to_path_buf();
            if !image.subfolder.is_empty() {
                path.push(&image.subfolder);
            }
            path.push(&image.filename);
            artifacts.push(path);
        }
    }
    Ok(HistoryStatus::Completed(artifacts))
}

// ---- private helpers ----

fn error_message(status: &HistoryEntryStatus) -> String {
    status
        .messages
        .iter()
        .find(|(kind, _)| kind == "execution_error")
        .map(|(_, details)| {
            let node = details.get("node_type").and_then(Value::as_str).unwrap_or("unknown node");
            let message = details
                .get("exception_message")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            format!("{node}: {}", message.trim())
        })
        .unwrap_or_else(|| "execution failed".to_string())
}

/// Order numeric node ids numerically, everything else lexically after.
fn natural_id_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn queue_ids_are_extracted() {
        let v = json!({
            "queue_running": [[3, "run-1", {}, {}, ["9"]]],
            "queue_pending": [[4, "pend-1", {}, {}, []], [5, "pend-2", {}, {}, []]]
        });
        let q = parse_queue(&v).unwrap();
        assert_eq!(q.running, vec!["run-1"]);
        assert_eq!(q.pending, vec!["pend-1", "pend-2"]);
        assert!(q.contains("pend-2"));
        assert!(!q.contains("other"));
    }

    #[test]
    fn empty_history_is_pending() {
        let status = parse_history("abc", &json!({}), Path::new("/out")).unwrap();
        assert_eq!(status, HistoryStatus::Pending);
        assert!(!status.is_terminal());
    }

    #[test]
    fn success_lists_output_images_only() {
        let v = json!({"abc": {
            "outputs": {
                "12": {"images": [{"filename": "b.png", "subfolder": "", "type": "output"}]},
                "9": {"images": [
                    {"filename": "a_00001_.png", "subfolder": "IL/anime", "type": "output"},
                    {"filename": "tmp.png", "subfolder": "", "type": "temp"}
                ]}
            },
            "status": {"status_str": "success", "completed": true, "messages": []}
        }});
        let status = parse_history("abc", &v, Path::new("/out")).unwrap();
        assert_eq!(
            status,
            HistoryStatus::Completed(vec![
                PathBuf::from("/out/IL/anime/a_00001_.png"),
                PathBuf::from("/out/b.png"),
            ])
        );
    }

    #[test]
    fn error_status_carries_exception_message() {
        let v = json!({"abc": {
            "outputs": {},
            "status": {"status_str": "error", "completed": false, "messages": [
                ["execution_start", {"prompt_id": "abc"}],
                ["execution_error", {"node_type": "KSampler", "exception_message": "OOM\n"}]
            ]}
        }});
        assert_matches!(
            parse_history("abc", &v, Path::new("/out")).unwrap(),
            HistoryStatus::Failed(msg) if msg == "KSampler: OOM"
        );
    }

    #[test]
    fn entry_without_status_is_completed() {
        let v = json!({"abc": {"outputs": {}}});
        assert_eq!(
            parse_history("abc", &v, Path::new("/out")).unwrap(),
            HistoryStatus::Completed(vec![])
        );
    }
}
