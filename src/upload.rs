//! Preview generation for uploaded files.

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UploadResponse {
    pub success: bool,
    pub filename: String,
    pub size: u64,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    pub content: String,
}

/// Text preview of at most `max_chars` characters, with `...` appended when
/// cut short. Bodies that are not text get a placeholder.
pub fn preview(body: &[u8], file_type: Option<&str>, max_chars: usize) -> String {
    if !looks_textual(body, file_type) {
        return format!("[binary file: {} bytes]", body.len());
    }
    let text = String::from_utf8_lossy(body);
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn looks_textual(body: &[u8], file_type: Option<&str>) -> bool {
    if let Some(kind) = file_type {
        let kind = kind.to_ascii_lowercase();
        if kind.starts_with("text/")
            || kind.contains("json")
            || kind.contains("xml")
            || kind.contains("javascript")
        {
            return true;
        }
    }
    // Sniff the head: NUL bytes or invalid UTF-8 mean binary.
    let head = &body[..body.len().min(8192)];
    !head.contains(&0)
        && match std::str::from_utf8(head) {
            Ok(_) => true,
            // A multi-byte char cut at the sniff boundary is still text.
            Err(err) => err.error_len().is_none(),
        }
}
