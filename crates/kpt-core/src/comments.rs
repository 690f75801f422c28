//! Comment and scalar-style tracking
//!
//! `serde_yaml` drops comments, so they are recovered by a line scanner that
//! follows block indentation and records, per [`FieldPath`], the comments
//! above a node (head), after it on the same line (line) and trailing its
//! block (foot). The original quoting style of scalars is kept alongside.

use serde_yaml::Value;
use std::collections::BTreeMap;

use crate::resource::{FieldPath, visit_fields};

/// Presentation of a scalar in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarStyle {
    Plain,
    SingleQuoted,
    DoubleQuoted,
    Literal,
    Folded,
    /// A key with no value at all (`key:`)
    Empty,
}

/// Comments attached to one node; each entry is a full `# ...` comment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeComments {
    pub head: Vec<String>,
    pub line: Option<String>,
    pub foot: Vec<String>,
}

impl NodeComments {
    pub fn is_empty(&self) -> bool {
        self.head.is_empty() && self.line.is_none() && self.foot.is_empty()
    }
}

/// Comments and scalar styles of one document, keyed by field path
///
/// The root path holds comments before the first node (head) and after the
/// last one (foot).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentMap {
    nodes: BTreeMap<FieldPath, NodeComments>,
    styles: BTreeMap<FieldPath, ScalarStyle>,
}

impl CommentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan block-style YAML text for comments and scalar styles
    pub fn scan(text: &str) -> Self {
        let mut scanner = Scanner::default();
        for line in text.lines() {
            scanner.line(line.trim_end_matches('\r'));
        }
        scanner.finish()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.styles.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&NodeComments> {
        self.nodes.get(path).filter(|c| !c.is_empty())
    }

    pub fn entry(&mut self, path: FieldPath) -> &mut NodeComments {
        self.nodes.entry(path).or_default()
    }

    pub fn set(&mut self, path: FieldPath, comments: NodeComments) {
        if comments.is_empty() {
            self.nodes.remove(&path);
        } else {
            self.nodes.insert(path, comments);
        }
    }

    pub fn style(&self, path: &FieldPath) -> Option<ScalarStyle> {
        self.styles.get(path).copied()
    }

    pub fn set_style(&mut self, path: FieldPath, style: ScalarStyle) {
        self.styles.insert(path, style);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &NodeComments)> {
        self.nodes.iter().filter(|(_, c)| !c.is_empty())
    }

    /// Comments below `prefix`, re-keyed relative to it
    pub fn subtree(&self, prefix: &FieldPath) -> CommentMap {
        let nodes = self
            .nodes
            .iter()
            .filter_map(|(p, c)| p.strip_prefix(prefix).map(|rel| (rel, c.clone())))
            .collect();
        let styles = self
            .styles
            .iter()
            .filter_map(|(p, s)| p.strip_prefix(prefix).map(|rel| (rel, *s)))
            .collect();
        CommentMap { nodes, styles }
    }

    /// Copy entries of `other` for paths this map knows nothing about
    pub fn fill_missing(&mut self, other: &CommentMap) {
        for (path, comments) in &other.nodes {
            if self.get(path).is_none() && !comments.is_empty() {
                self.nodes.insert(path.clone(), comments.clone());
            }
        }
        for (path, style) in &other.styles {
            self.styles.entry(path.clone()).or_insert(*style);
        }
    }

    /// Build a map for `value` taking, per node, the comments of the first
    /// source that has any for it
    pub fn select(value: &Value, sources: &[&CommentMap]) -> CommentMap {
        let mut out = CommentMap::new();
        visit_fields(value, &mut |path: &FieldPath, _: &Value| {
            if let Some(c) = sources.iter().find_map(|s| s.get(path)) {
                out.nodes.insert(path.clone(), c.clone());
            }
            if let Some(style) = sources.iter().find_map(|s| s.style(path)) {
                out.styles.insert(path.clone(), style);
            }
        });
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Map,
    Seq,
}

#[derive(Debug)]
struct Frame {
    indent: usize,
    kind: FrameKind,
    path: FieldPath,
    next_index: usize,
    last_child: Option<FieldPath>,
}

impl Frame {
    fn new(indent: usize, kind: FrameKind, path: FieldPath) -> Self {
        Self {
            indent,
            kind,
            path,
            next_index: 0,
            last_child: None,
        }
    }
}

#[derive(Debug, Default)]
struct Scanner {
    map: CommentMap,
    stack: Vec<Frame>,
    /// Full-line comments not yet attached, with their indentation
    pending: Vec<(usize, String)>,
    /// Head comments for the node started by the current line
    heads: Vec<String>,
    /// Key or item with no inline value, waiting for its children
    pending_parent: Option<(FieldPath, usize)>,
    /// Lines indented deeper than this belong to a scalar and are skipped
    skip_deeper_than: Option<usize>,
    seen_content: bool,
}

impl Scanner {
    fn line(&mut self, line: &str) {
        let rest = line.trim_start_matches(' ');
        let indent = line.len() - rest.len();
        let content = rest.trim_end();

        if let Some(limit) = self.skip_deeper_than {
            if content.is_empty() || indent > limit {
                return;
            }
            self.skip_deeper_than = None;
        }
        if content.is_empty() {
            return;
        }
        if indent == 0
            && (content == "---" || content.starts_with("--- ") || content == "..." || content.starts_with('%'))
        {
            return;
        }
        if content.starts_with('#') {
            self.pending.push((indent, content.to_string()));
            return;
        }

        self.flush_pending(indent);

        if let Some((parent, parent_indent)) = self.pending_parent.take() {
            let seq = is_seq_item(content);
            if indent > parent_indent || (indent == parent_indent && seq) {
                let kind = if seq { FrameKind::Seq } else { FrameKind::Map };
                self.stack.push(Frame::new(indent, kind, parent));
            } else {
                self.map.set_style(parent, ScalarStyle::Empty);
            }
        }

        while let Some(top) = self.stack.last() {
            let ends_compact_seq =
                top.indent == indent && top.kind == FrameKind::Seq && !is_seq_item(content);
            if top.indent > indent || ends_compact_seq {
                self.stack.pop();
            } else {
                break;
            }
        }

        if is_seq_item(content) {
            self.seq_item(indent, content);
        } else {
            self.map_entry(indent, content);
        }
    }

    /// Split pending comments into feet of the block they sit in and heads of
    /// the node on the current line
    fn flush_pending(&mut self, indent: usize) {
        for (comment_indent, text) in std::mem::take(&mut self.pending) {
            if !self.seen_content {
                self.map.entry(FieldPath::root()).head.push(text);
                continue;
            }
            // a key still waiting for its children owns no block to trail
            if comment_indent > indent && self.pending_parent.is_none() {
                let owner = self
                    .stack
                    .iter()
                    .rev()
                    .find(|f| f.indent <= comment_indent)
                    .and_then(|f| f.last_child.clone());
                if let Some(owner) = owner {
                    self.map.entry(owner).foot.push(text);
                    continue;
                }
            }
            self.heads.push(text);
        }
    }

    fn start_node(&mut self, path: &FieldPath) {
        self.seen_content = true;
        if !self.heads.is_empty() {
            let heads = std::mem::take(&mut self.heads);
            self.map.entry(path.clone()).head.extend(heads);
        }
    }

    fn seq_item(&mut self, indent: usize, content: &str) {
        let rest = content[1..].trim_start();

        let needs_frame = !matches!(self.stack.last(), Some(f) if f.kind == FrameKind::Seq && f.indent == indent);
        if needs_frame {
            let path = self.container_path();
            self.stack.push(Frame::new(indent, FrameKind::Seq, path));
        }
        let Some(frame) = self.stack.last_mut() else {
            return;
        };
        let item = frame.path.index(frame.next_index);
        frame.next_index += 1;
        frame.last_child = Some(item.clone());
        self.start_node(&item);

        if rest.is_empty() || rest.starts_with('#') {
            if !rest.is_empty() {
                self.map.entry(item.clone()).line = Some(rest.to_string());
            }
            self.pending_parent = Some((item, indent));
            return;
        }

        let child_indent = indent + (content.len() - rest.len());
        if is_seq_item(rest) {
            self.stack.push(Frame::new(child_indent, FrameKind::Seq, item));
            self.seq_item(child_indent, rest);
        } else if find_key(rest).is_some() {
            self.stack.push(Frame::new(child_indent, FrameKind::Map, item));
            self.map_entry(child_indent, rest);
        } else {
            self.scalar(item, rest, indent);
        }
    }

    fn map_entry(&mut self, indent: usize, content: &str) {
        let Some((key, value)) = find_key(content) else {
            return;
        };

        let needs_frame = !matches!(self.stack.last(), Some(f) if f.kind == FrameKind::Map && f.indent == indent);
        if needs_frame {
            let path = self.container_path();
            self.stack.push(Frame::new(indent, FrameKind::Map, path));
        }
        let Some(frame) = self.stack.last_mut() else {
            return;
        };
        let path = frame.path.child(key);
        frame.last_child = Some(path.clone());
        self.start_node(&path);

        let value = value.trim_start();
        if value.is_empty() || value.starts_with('#') {
            if !value.is_empty() {
                self.map.entry(path.clone()).line = Some(value.to_string());
            }
            self.pending_parent = Some((path, indent));
        } else {
            self.scalar(path, value, indent);
        }
    }

    fn scalar(&mut self, path: FieldPath, value: &str, indent: usize) {
        let (_, comment) = split_comment(value);
        if let Some(comment) = comment {
            self.map.entry(path.clone()).line = Some(comment);
        }
        let style = match value.as_bytes().first() {
            Some(b'"') => Some(ScalarStyle::DoubleQuoted),
            Some(b'\'') => Some(ScalarStyle::SingleQuoted),
            Some(b'|') => Some(ScalarStyle::Literal),
            Some(b'>') => Some(ScalarStyle::Folded),
            _ => None,
        };
        if let Some(style) = style {
            self.map.set_style(path, style);
        }
        self.skip_deeper_than = Some(indent);
    }

    /// Path new frames hang off when the text skips a level
    fn container_path(&self) -> FieldPath {
        self.stack
            .last()
            .map(|f| f.last_child.clone().unwrap_or_else(|| f.path.clone()))
            .unwrap_or_default()
    }

    fn finish(mut self) -> CommentMap {
        if let Some((parent, _)) = self.pending_parent.take() {
            self.map.set_style(parent, ScalarStyle::Empty);
        }
        let trailing: Vec<String> = self.pending.drain(..).map(|(_, text)| text).collect();
        if !trailing.is_empty() {
            let root = self.map.entry(FieldPath::root());
            if self.seen_content {
                root.foot.extend(trailing);
            } else {
                root.head.extend(trailing);
            }
        }
        self.map
    }
}

fn is_seq_item(content: &str) -> bool {
    content == "-" || content.starts_with("- ") || content.starts_with("-\t")
}

/// Split `key: value` honoring quoted keys
fn find_key(s: &str) -> Option<(String, &str)> {
    let first = *s.as_bytes().first()?;
    if first == b'"' || first == b'\'' {
        let end = closing_quote(s)?;
        let after = s[end + 1..].trim_start();
        let value = after.strip_prefix(':')?;
        if !(value.is_empty() || value.starts_with(' ') || value.starts_with('\t')) {
            return None;
        }
        let raw = &s[..=end];
        let key = serde_yaml::from_str::<String>(raw)
            .unwrap_or_else(|_| raw[1..raw.len() - 1].to_string());
        return Some((key, value));
    }
    if matches!(first, b'[' | b'{' | b'|' | b'>' | b'#' | b'?') {
        return None;
    }

    let bytes = s.as_bytes();
    for (i, c) in s.char_indices() {
        if c == '#' && i > 0 && matches!(bytes[i - 1], b' ' | b'\t') {
            return None;
        }
        if c == ':' {
            let next = bytes.get(i + 1);
            if next.is_none() || matches!(next, Some(b' ') | Some(b'\t')) {
                return Some((s[..i].trim_end().to_string(), &s[i + 1..]));
            }
        }
    }
    None
}

/// Byte offset of the quote closing the quoted scalar `s` starts with
fn closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let quote = *bytes.first()?;
    let mut i = 1;
    while i < bytes.len() {
        let b = bytes[i];
        if quote == b'"' && b == b'\\' {
            i += 2;
            continue;
        }
        if b == quote {
            if quote == b'\'' && bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Separate a trailing `# comment` from an inline value
fn split_comment(value: &str) -> (&str, Option<String>) {
    let start = match value.as_bytes().first() {
        Some(b'"') | Some(b'\'') => match closing_quote(value) {
            Some(end) => end + 1,
            None => return (value, None),
        },
        _ => 0,
    };
    let bytes = value.as_bytes();
    for (i, c) in value[start..].char_indices() {
        let pos = start + i;
        if c == '#' && (pos == 0 || matches!(bytes[pos - 1], b' ' | b'\t')) {
            return (
                value[..pos].trim_end(),
                Some(value[pos..].trim_end().to_string()),
            );
        }
    }
    (value, None)
}
