use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type DiagnosticPayload = Map<String, Value>;

/// Append-only JSONL sink for backend misbehavior worth keeping: unusable
/// model outputs, cache write warnings. One compact object per line with
/// default `type` and `ts` fields; the caller payload is merged last and
/// can override them.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    inner: Arc<DiagnosticLogInner>,
}

#[derive(Debug)]
struct DiagnosticLogInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DiagnosticLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(DiagnosticLogInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn emit(&self, event_type: &str, payload: DiagnosticPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("diagnostic log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::Value;

    use super::{DiagnosticLog, DiagnosticPayload};

    #[test]
    fn emit_appends_compact_jsonl_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("diagnostics.jsonl");
        let log = DiagnosticLog::new(&path);

        let mut payload = DiagnosticPayload::new();
        payload.insert("body".to_string(), Value::String("<|im_start|>".to_string()));
        let emitted = log.emit("unusable_output", payload)?;
        log.emit("unusable_output", DiagnosticPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: Value = serde_json::from_str(lines[0])?;
        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("unusable_output".to_string()));
        assert_eq!(parsed["body"], Value::String("<|im_start|>".to_string()));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }
}
