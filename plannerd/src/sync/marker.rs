//! Text codecs for links embedded in free-text remote fields.
//!
//! Calendar events carry `planner_task_id:<id>` in their description. Legacy
//! tasks-backend items carry a one-line JSON object in front of their notes.

use serde::{Deserialize, Serialize};

const MARKER_KEY: &str = "planner_task_id";

pub fn marker_for(task_id: i64) -> String {
    format!("{MARKER_KEY}:{task_id}")
}

/// Byte range and task id of the first marker in `text`. The key is matched
/// case-insensitively and whitespace around the colon is allowed.
fn locate_marker(text: &str) -> Option<(usize, usize, i64)> {
    let lowered = text.to_ascii_lowercase();
    let mut from = 0;
    while let Some(found) = lowered[from..].find(MARKER_KEY) {
        let start = from + found;
        let bytes = lowered.as_bytes();
        let mut pos = start + MARKER_KEY.len();
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos < bytes.len() && bytes[pos] == b':' {
            pos += 1;
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            let digits_start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos > digits_start
                && let Ok(id) = text[digits_start..pos].parse::<i64>()
            {
                return Some((start, pos, id));
            }
        }
        from = start + MARKER_KEY.len();
    }
    None
}

pub fn find_marker(text: &str) -> Option<i64> {
    locate_marker(text).map(|(_, _, id)| id)
}

pub fn strip_marker(text: &str) -> String {
    let mut out = text.to_string();
    while let Some((start, end, _)) = locate_marker(&out) {
        out.replace_range(start..end, "");
    }
    out.trim().to_string()
}

/// Description carrying exactly one marker for `task_id`, appended on its own line.
pub fn ensure_marker(text: Option<&str>, task_id: i64) -> String {
    let body = strip_marker(text.unwrap_or_default());
    if body.is_empty() {
        marker_for(task_id)
    } else {
        format!("{body}\n{}", marker_for(task_id))
    }
}

/// Metadata carried inside notes by older clients. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotesMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Splits `{json}\n\nbody` notes. Notes without a JSON first line come back untouched.
pub fn split_notes(raw: Option<&str>) -> (Option<NotesMetadata>, String) {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return (None, String::new());
    };
    let stripped = raw.trim_start();
    let (first_line, remainder) = stripped.split_once('\n').unwrap_or((stripped, ""));
    let first_line = first_line.trim();
    if first_line.starts_with('{')
        && let Ok(meta) = serde_json::from_str::<NotesMetadata>(first_line)
    {
        return (Some(meta), remainder.trim_start_matches('\n').to_string());
    }
    (None, raw.to_string())
}

/// Inverse of [`split_notes`]. Field order is alphabetical.
pub fn compose_notes(meta: &NotesMetadata, body: &str) -> String {
    let payload = serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_string());
    let body = body.trim();
    if body.is_empty() {
        payload
    } else {
        format!("{payload}\n\n{body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_marker_case_insensitively_with_spaces() {
        assert_eq!(find_marker("notes\nPLANNER_TASK_ID : 42"), Some(42));
        assert_eq!(find_marker("planner_task_id:7 trailing"), Some(7));
        assert_eq!(find_marker("planner_task_id: none"), None);
        assert_eq!(find_marker(""), None);
    }

    #[test]
    fn strip_removes_marker_line() {
        assert_eq!(strip_marker("Agenda\nplanner_task_id:3"), "Agenda");
        assert_eq!(strip_marker("planner_task_id:3"), "");
    }

    #[test]
    fn ensure_replaces_stale_marker() {
        assert_eq!(ensure_marker(Some("Agenda\nplanner_task_id:3"), 5), "Agenda\nplanner_task_id:5");
        assert_eq!(ensure_marker(None, 5), "planner_task_id:5");
        let once = ensure_marker(Some("x"), 9);
        assert_eq!(ensure_marker(Some(&once), 9), once);
    }

    #[test]
    fn notes_metadata_round_trip_keeps_body() {
        let meta = NotesMetadata {
            task_id: Some(1),
            priority: Some(2),
            status: Some("doing".into()),
            ..NotesMetadata::default()
        };
        let composed = compose_notes(&meta, "buy milk");
        assert_eq!(
            composed,
            "{\"priority\":2,\"status\":\"doing\",\"task_id\":1}\n\nbuy milk"
        );
        let (parsed, body) = split_notes(Some(&composed));
        assert_eq!(parsed, Some(meta));
        assert_eq!(body, "buy milk");
    }

    #[test]
    fn plain_notes_have_no_metadata() {
        let (meta, body) = split_notes(Some("{not json\nstill body"));
        assert!(meta.is_none());
        assert_eq!(body, "{not json\nstill body");
        assert_eq!(split_notes(None), (None, String::new()));
    }
}
