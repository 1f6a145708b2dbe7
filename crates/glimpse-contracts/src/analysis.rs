use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiElement {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_status")]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub title: String,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub recommendation: String,
}

/// Structured screen analysis as requested from the model. Every field is
/// defaulted so a partially conforming response still parses.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScreenAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub ui_elements: Vec<UiElement>,
    #[serde(default)]
    pub detected_text: Vec<String>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub next_checks: Vec<String>,
}

fn default_status() -> String {
    "visible".to_string()
}

fn default_severity() -> String {
    "medium".to_string()
}

/// A persisted analysis result: structured when the model answered with
/// parseable JSON, raw text otherwise. Only validated successes are stored.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredResult {
    Structured(ScreenAnalysis),
    Raw(String),
}

impl StoredResult {
    pub fn is_structured(&self) -> bool {
        matches!(self, StoredResult::Structured(_))
    }
}

/// Parses raw model output into a structured result, falling back to the
/// raw text when the JSON cannot be recovered.
pub fn parse_result(raw: &str) -> StoredResult {
    let candidate = extract_json_object(raw);
    match serde_json::from_str::<ScreenAnalysis>(&candidate) {
        Ok(analysis) => StoredResult::Structured(analysis),
        Err(_) => StoredResult::Raw(raw.to_string()),
    }
}

/// Best-effort extraction of the JSON object from model output: the first
/// markdown-fenced block when present, otherwise the span from the first
/// `{` to the last `}`, otherwise the trimmed input.
pub fn extract_json_object(text: &str) -> String {
    if let Some(fenced) = first_fenced_block(text) {
        return fenced.trim().to_string();
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            return text[start..=end].to_string();
        }
    }
    text.trim().to_string()
}

fn first_fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}
