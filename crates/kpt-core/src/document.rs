//! Multi-document YAML splitting
//!
//! A file is split on `---` lines. Every resulting resource keeps the exact
//! text it came from; empty and comment-only documents are folded into the
//! raw text of a neighbour so that concatenating the raw texts of all
//! resources reproduces the file.

use serde_yaml::Value;

use crate::comments::CommentMap;
use crate::error::{CoreError, Result};
use crate::resource::Resource;

#[derive(Debug, Default)]
struct Chunk {
    raw: String,
    body: String,
}

impl Chunk {
    fn is_empty(&self) -> bool {
        self.body.lines().all(|line| {
            let line = line.trim();
            line.is_empty() || line.starts_with('#') || line == "..." || line.starts_with('%')
        })
    }
}

/// Whether `line` separates two documents
pub fn is_separator(line: &str) -> bool {
    let line = line.trim_end_matches(['\n', '\r']);
    line == "---" || line.starts_with("--- ") || line.starts_with("---\t")
}

/// Whether the first line of `raw` is a separator
pub(crate) fn starts_with_separator(raw: &str) -> bool {
    raw.lines().next().is_some_and(is_separator)
}

fn split_chunks(text: &str) -> Vec<Chunk> {
    let mut chunks = vec![Chunk::default()];
    for line in text.split_inclusive('\n') {
        if is_separator(line) {
            let mut chunk = Chunk {
                raw: line.to_string(),
                body: String::new(),
            };
            let rest = line.trim_end()[3..].trim();
            if !rest.is_empty() && !rest.starts_with('#') {
                chunk.body.push_str(rest);
                chunk.body.push('\n');
            }
            chunks.push(chunk);
        } else if let Some(current) = chunks.last_mut() {
            current.raw.push_str(line);
            current.body.push_str(line);
        }
    }
    chunks
}

/// Parse every non-empty document of `text`
///
/// `origin` names the source in error messages.
pub fn parse_documents(text: &str, origin: &str) -> Result<Vec<Resource>> {
    let mut parsed: Vec<(Value, CommentMap, String)> = Vec::new();
    let mut leading = String::new();

    for chunk in split_chunks(text) {
        if chunk.is_empty() {
            leading.push_str(&chunk.raw);
            continue;
        }

        let value: Value = serde_yaml::from_str(&chunk.body).map_err(|source| CoreError::Parse {
            path: origin.to_string(),
            source,
        })?;
        if value.is_null() {
            leading.push_str(&chunk.raw);
            continue;
        }

        let raw = std::mem::take(&mut leading) + &chunk.raw;
        let comments = CommentMap::scan(&raw);
        parsed.push((value, comments, raw));
    }

    if !leading.is_empty() {
        if let Some((_, _, raw)) = parsed.last_mut() {
            raw.push_str(&leading);
        }
    }

    Ok(parsed
        .into_iter()
        .enumerate()
        .map(|(i, (value, comments, raw))| Resource::from_source(value, comments, raw, i == 0))
        .collect())
}
