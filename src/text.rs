/// Telegram caps message text at 4096 characters; chunks stay a bit under.
pub const CHUNK_LIMIT: usize = 4000;
/// Cap for summary / edited summary text to avoid DB bloat.
pub const SUMMARY_MAX_LENGTH: usize = 50_000;

/// Remove markdown-style `**` and `*` markers. `**` first so a bold pair
/// does not decay into two stray italics markers.
pub fn strip_markdown_asterisks(text: &str) -> String {
    text.replace("**", "").replace('*', "")
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

/// Split text into chunks of at most `limit` characters, breaking at the
/// last space or newline before the limit so words stay intact. A text that
/// fits returns a single chunk; empty/whitespace-only input returns none.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest: &[char] = &chars;
    while !rest.is_empty() {
        if rest.len() <= limit {
            chunks.push(rest.iter().collect::<String>());
            break;
        }
        let window = &rest[..limit + 1];
        let break_at = window
            .iter()
            .rposition(|c| *c == ' ' || *c == '\n')
            .filter(|&i| i > 0)
            .unwrap_or(limit);
        let chunk: String = rest[..break_at].iter().collect();
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        rest = &rest[break_at..];
        while let Some((first, tail)) = rest.split_first() {
            if first.is_whitespace() {
                rest = tail;
            } else {
                break;
            }
        }
    }
    chunks
}
