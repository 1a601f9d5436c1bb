//! Session-file tail scans.
//!
//! Permission detection and takeover both operate on the *tail* of a session
//! file: the external agent appends, so the last few records are all that
//! matter. The scan window is 64 KiB; the first (possibly partial) line of
//! the window is discarded.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::records::{parse_records, ContentBlock, Record, RecordKind};
use super::StoreResult;

pub const TAIL_WINDOW: u64 = 64 * 1024;

/// A tool invocation awaiting its result in the record stream.
#[derive(Clone, Debug)]
pub struct PendingToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl PendingToolUse {
    /// Short human-readable descriptor for notifications.
    pub fn descriptor(&self) -> String {
        match self.input.get("command").and_then(Value::as_str) {
            Some(cmd) => {
                let mut snippet: String = cmd.chars().take(60).collect();
                if cmd.chars().count() > 60 {
                    snippet.push('…');
                }
                format!("{}: {}", self.name, snippet)
            }
            None => self.name.clone(),
        }
    }
}

/// Read the last [`TAIL_WINDOW`] bytes of `path` and parse the complete
/// records found there.
pub async fn read_tail_records(path: &Path) -> StoreResult<Vec<Record>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    let (start, skip_first) = if len > TAIL_WINDOW {
        (len - TAIL_WINDOW, true)
    } else {
        (0, false)
    };

    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;

    let text = String::from_utf8_lossy(&buf);
    let text: &str = if skip_first {
        match text.find('\n') {
            Some(pos) => &text[pos + 1..],
            None => "",
        }
    } else {
        &text
    };

    Ok(parse_records(text))
}

/// Read records appended after `offset`, returning them with the new end
/// offset. Used by the watcher's incremental tailing.
pub async fn read_from_offset(path: &Path, offset: u64) -> StoreResult<(Vec<Record>, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len <= offset {
        return Ok((Vec::new(), len));
    }

    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut buf).await?;

    let body = String::from_utf8_lossy(&buf);
    Ok((parse_records(&body), len))
}

/// Fold a record slice into the set of pending tool uses: tool_use blocks
/// from assistant entries not yet cleared by a later user tool_result with
/// the same correlation id.
pub fn fold_pending(pending: &mut HashMap<String, PendingToolUse>, records: &[Record]) {
    for record in records {
        match record.kind {
            RecordKind::Assistant => {
                for block in record.blocks() {
                    if let ContentBlock::ToolUse { id, name, input } = block {
                        pending.insert(
                            id.clone(),
                            PendingToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            },
                        );
                    }
                }
            }
            RecordKind::User => {
                for block in record.blocks() {
                    if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                        pending.remove(tool_use_id);
                    }
                }
            }
            RecordKind::System => {}
        }
    }
}

/// Pending tool uses in the tail of `path`, in first-seen order.
pub async fn pending_tool_uses(path: &Path) -> StoreResult<Vec<PendingToolUse>> {
    let records = read_tail_records(path).await?;
    let mut pending = HashMap::new();
    fold_pending(&mut pending, &records);

    // Re-walk to restore emission order; the map alone loses it.
    let mut ordered = Vec::with_capacity(pending.len());
    for record in &records {
        for block in record.blocks() {
            if let ContentBlock::ToolUse { id, .. } = block {
                if let Some(p) = pending.remove(id) {
                    ordered.push(p);
                }
            }
        }
    }
    Ok(ordered)
}

/// Last real user text input in the tail of `path` (takeover resubmits it).
pub async fn last_user_input(path: &Path) -> StoreResult<Option<String>> {
    let records = read_tail_records(path).await?;
    Ok(records
        .iter()
        .rev()
        .find(|r| r.is_real_user_text())
        .and_then(Record::text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn user_text(text: &str) -> String {
        format!(r#"{{"type":"user","message":{{"role":"user","content":"{text}"}}}}"#)
    }

    fn assistant_tool_use(id: &str, name: &str) -> String {
        format!(
            r#"{{"type":"assistant","message":{{"role":"assistant","content":[{{"type":"tool_use","id":"{id}","name":"{name}","input":{{"command":"ls -la"}}}}]}}}}"#
        )
    }

    fn user_tool_result(id: &str) -> String {
        format!(
            r#"{{"type":"user","message":{{"role":"user","content":[{{"type":"tool_result","tool_use_id":"{id}"}}]}}}}"#
        )
    }

    fn write_session(lines: &[String]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        (dir, path)
    }

    #[tokio::test]
    async fn test_pending_cleared_by_result() {
        let (_dir, path) = write_session(&[
            user_text("run it"),
            assistant_tool_use("tu_1", "Bash"),
            user_tool_result("tu_1"),
            assistant_tool_use("tu_2", "Edit"),
        ]);

        let pending = pending_tool_uses(&path).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "tu_2");
        assert_eq!(pending[0].name, "Edit");
    }

    #[tokio::test]
    async fn test_no_pending_when_all_resolved() {
        let (_dir, path) = write_session(&[
            assistant_tool_use("tu_1", "Bash"),
            user_tool_result("tu_1"),
        ]);
        assert!(pending_tool_uses(&path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_user_input_skips_tool_results() {
        let (_dir, path) = write_session(&[
            user_text("first prompt"),
            assistant_tool_use("tu_1", "Bash"),
            user_tool_result("tu_1"),
        ]);
        let last = last_user_input(&path).await.unwrap();
        assert_eq!(last.as_deref(), Some("first prompt"));
    }

    #[tokio::test]
    async fn test_read_from_offset_incremental() {
        let (_dir, path) = write_session(&[user_text("one")]);
        let (records, offset) = read_from_offset(&path, 0).await.unwrap();
        assert_eq!(records.len(), 1);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{}", user_text("two")).unwrap();

        let (records, end) = read_from_offset(&path, offset).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text().as_deref(), Some("two"));
        assert!(end > offset);

        let (records, _) = read_from_offset(&path, end).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_tail_window_drops_partial_first_line() {
        let filler = user_text(&"x".repeat(200));
        let mut lines: Vec<String> = std::iter::repeat_with(|| filler.clone()).take(400).collect();
        lines.push(assistant_tool_use("tu_tail", "Bash"));
        let (_dir, path) = write_session(&lines);

        assert!(std::fs::metadata(&path).unwrap().len() > TAIL_WINDOW);
        let pending = pending_tool_uses(&path).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "tu_tail");
    }
}
