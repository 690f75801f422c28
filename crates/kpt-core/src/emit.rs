//! Block-style YAML emitter that re-attaches comments
//!
//! Output uses two-space indentation with sequences placed at the same
//! indentation as their parent key. Strings that would read back as another
//! type are double-quoted; multi-line strings use literal block style.

use serde_yaml::{Mapping, Value};

use crate::comments::{CommentMap, ScalarStyle};
use crate::resource::{FieldPath, scalar_string};

/// Emit one document with its comments
pub fn emit_document(value: &Value, comments: &CommentMap) -> String {
    let mut emitter = Emitter {
        out: String::new(),
        comments,
    };
    let root = FieldPath::root();
    let root_comments = comments.get(&root).cloned().unwrap_or_default();

    emitter.lines(&root_comments.head, 0);
    match value {
        Value::Mapping(map) if !map.is_empty() => emitter.mapping(map, &root, 0),
        Value::Sequence(seq) if !seq.is_empty() => emitter.sequence(seq, &root, 0),
        other => {
            let text = emitter.scalar(other, &root);
            emitter.out.push_str(&text);
            emitter.out.push('\n');
        }
    }
    emitter.lines(&root_comments.foot, 0);
    emitter.out
}

/// Emit a value without comments
pub fn emit_value(value: &Value) -> String {
    emit_document(value, &CommentMap::new())
}

/// Turn an emitted document into an item of a block sequence at column zero
pub fn as_list_item(block: &str) -> String {
    let mut out = String::with_capacity(block.len() + 16);
    let mut marked = false;
    for line in block.lines() {
        if line.is_empty() {
            out.push('\n');
            continue;
        }
        if !marked {
            // leading comments sit at the item's own indent so they read
            // back as heads of the item
            if !line.trim_start().starts_with('#') {
                out.push_str("- ");
                marked = true;
            }
        } else {
            out.push_str("  ");
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Indent every non-empty line of `block`
pub fn indent_block(block: &str, indent: usize) -> String {
    let pad = " ".repeat(indent);
    let mut out = String::with_capacity(block.len());
    for line in block.lines() {
        if !line.is_empty() {
            out.push_str(&pad);
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

struct Emitter<'a> {
    out: String,
    comments: &'a CommentMap,
}

impl Emitter<'_> {
    fn lines(&mut self, lines: &[String], indent: usize) {
        for line in lines {
            self.pad(indent);
            self.out.push_str(line);
            self.out.push('\n');
        }
    }

    fn pad(&mut self, indent: usize) {
        for _ in 0..indent {
            self.out.push(' ');
        }
    }

    fn mapping(&mut self, map: &Mapping, path: &FieldPath, indent: usize) {
        for (key, value) in map {
            let key_text = match scalar_string(key) {
                Some(k) => k,
                None => serde_yaml::to_string(key)
                    .map(|s| s.trim_end().to_string())
                    .unwrap_or_default(),
            };
            let child = path.child(key_text.as_str());
            let comments = self.comments.get(&child).cloned().unwrap_or_default();

            self.lines(&comments.head, indent);
            let prefix = format!("{}{}:", " ".repeat(indent), format_key(&key_text));
            self.node(prefix, value, &child, indent + 2, indent, comments.line.as_deref());
            self.lines(&comments.foot, indent);
        }
    }

    fn sequence(&mut self, seq: &[Value], path: &FieldPath, indent: usize) {
        for (i, item) in seq.iter().enumerate() {
            let child = path.index(i);
            let comments = self.comments.get(&child).cloned().unwrap_or_default();
            self.lines(&comments.head, indent);

            let compact = comments.line.is_none()
                && match item {
                    Value::Mapping(m) => !m.is_empty(),
                    Value::Sequence(s) => !s.is_empty(),
                    _ => false,
                };

            if compact {
                let start = self.out.len();
                match item {
                    Value::Mapping(m) => self.mapping(m, &child, indent + 2),
                    Value::Sequence(s) => self.sequence(s, &child, indent + 2),
                    _ => {}
                }
                self.mark_item(start, indent);
            } else {
                let prefix = format!("{}-", " ".repeat(indent));
                self.node(prefix, item, &child, indent + 2, indent + 2, comments.line.as_deref());
            }
            self.lines(&comments.foot, indent);
        }
    }

    /// Replace the indentation of the first content line written since
    /// `start` with a `- ` marker
    fn mark_item(&mut self, start: usize, indent: usize) {
        let mut offset = start;
        for line in self.out[start..].split_inclusive('\n') {
            if !line.trim_start().starts_with('#') {
                let at = offset + indent;
                self.out.replace_range(at..at + 2, "- ");
                return;
            }
            offset += line.len();
        }
    }

    /// Write a node after `prefix` (`key:` or `-`)
    fn node(
        &mut self,
        prefix: String,
        value: &Value,
        path: &FieldPath,
        map_indent: usize,
        seq_indent: usize,
        line_comment: Option<&str>,
    ) {
        let suffix = line_comment.map(|c| format!(" {}", c)).unwrap_or_default();
        match value {
            Value::Mapping(map) if !map.is_empty() => {
                self.out.push_str(&prefix);
                self.out.push_str(&suffix);
                self.out.push('\n');
                self.mapping(map, path, map_indent);
            }
            Value::Sequence(seq) if !seq.is_empty() => {
                self.out.push_str(&prefix);
                self.out.push_str(&suffix);
                self.out.push('\n');
                self.sequence(seq, path, seq_indent);
            }
            Value::Tagged(tagged) => {
                let prefix = format!("{} {}", prefix, tagged.tag);
                self.node(prefix, &tagged.value, path, map_indent, seq_indent, line_comment);
            }
            Value::String(s) if literal_eligible(s) => {
                self.out.push_str(&prefix);
                self.out.push_str(" |");
                self.out.push_str(chomping(s));
                self.out.push_str(&suffix);
                self.out.push('\n');
                let body = s.strip_suffix('\n').unwrap_or(s);
                let block_indent = prefix.len() - prefix.trim_start().len() + 2;
                for line in body.split('\n') {
                    if !line.is_empty() {
                        self.pad(block_indent);
                        self.out.push_str(line);
                    }
                    self.out.push('\n');
                }
            }
            Value::Null if self.comments.style(path) == Some(ScalarStyle::Empty) => {
                self.out.push_str(&prefix);
                self.out.push_str(&suffix);
                self.out.push('\n');
            }
            other => {
                let text = self.scalar(other, path);
                self.out.push_str(&prefix);
                self.out.push(' ');
                self.out.push_str(&text);
                self.out.push_str(&suffix);
                self.out.push('\n');
            }
        }
    }

    fn scalar(&self, value: &Value, path: &FieldPath) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => format_string(s, self.comments.style(path)),
            Value::Mapping(_) => "{}".to_string(),
            Value::Sequence(_) => "[]".to_string(),
            Value::Tagged(tagged) => format!("{} {}", tagged.tag, self.scalar(&tagged.value, path)),
        }
    }
}

fn format_key(key: &str) -> String {
    if needs_quotes(key) || key.contains('\n') {
        double_quote(key)
    } else {
        key.to_string()
    }
}

fn format_string(s: &str, style: Option<ScalarStyle>) -> String {
    if s.contains('\n') || has_control(s) {
        return double_quote(s);
    }
    match style {
        Some(ScalarStyle::SingleQuoted) => single_quote(s),
        Some(ScalarStyle::DoubleQuoted) => double_quote(s),
        _ if needs_quotes(s) => double_quote(s),
        _ => s.to_string(),
    }
}

fn literal_eligible(s: &str) -> bool {
    s.contains('\n')
        && !s.trim().is_empty()
        && !s.starts_with([' ', '\t'])
        && !s.chars().any(|c| c.is_control() && c != '\n' && c != '\t')
}

fn chomping(s: &str) -> &'static str {
    if !s.ends_with('\n') {
        "-"
    } else if s.ends_with("\n\n") {
        "+"
    } else {
        ""
    }
}

fn has_control(s: &str) -> bool {
    s.chars().any(|c| c.is_control() && c != '\t')
}

/// Whether a plain scalar would be read back as something other than this
/// string
pub fn needs_quotes(s: &str) -> bool {
    if s.is_empty() || s != s.trim() {
        return true;
    }
    let lower = s.to_ascii_lowercase();
    if matches!(
        lower.as_str(),
        "true" | "false" | "yes" | "no" | "on" | "off" | "y" | "n" | "null" | "~"
    ) {
        return true;
    }
    if looks_numeric(s) {
        return true;
    }

    let mut chars = s.chars();
    let first = chars.next().unwrap_or(' ');
    let second = chars.next();
    if matches!(
        first,
        '&' | '*' | '!' | '|' | '>' | '\'' | '"' | '%' | '@' | '`' | '#' | ',' | '[' | ']' | '{' | '}'
    ) {
        return true;
    }
    if matches!(first, '-' | '?' | ':') && matches!(second, None | Some(' ')) {
        return true;
    }
    if s.starts_with("---") || s.starts_with("...") {
        return true;
    }
    s.contains(": ") || s.contains(" #") || s.ends_with(':') || has_control(s)
}

fn looks_numeric(s: &str) -> bool {
    if s.parse::<f64>().is_ok() {
        return true;
    }
    let unsigned = s.trim_start_matches(['+', '-']).to_ascii_lowercase();
    if unsigned.starts_with("0x") || unsigned.starts_with("0o") || unsigned.starts_with("0b") {
        return true;
    }
    if matches!(unsigned.as_str(), ".inf" | ".nan") {
        return true;
    }
    s.starts_with(|c: char| c.is_ascii_digit())
        && s.chars().all(|c| c.is_ascii_digit() || "-:._+ ".contains(c))
}

fn single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn double_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(yaml: &str) -> String {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        emit_document(&value, &CommentMap::scan(yaml))
    }

    #[test]
    fn test_emit_deployment_with_comments() {
        let out = emit(
            r#"# app deployment
apiVersion: apps/v1
kind: Deployment
metadata:
    name: app # the app
spec:
    template:
        spec:
            containers:
              # main container
              - name: app
                image: "app:1.0"
                args: ['--port', '8080']
"#,
        );
        insta::assert_snapshot!(out, @r#"
# app deployment
apiVersion: apps/v1
kind: Deployment
metadata:
  name: app # the app
spec:
  template:
    spec:
      containers:
      # main container
      - name: app
        image: "app:1.0"
        args:
        - --port
        - "8080"
"#);
    }

    #[test]
    fn test_ambiguous_strings_are_quoted() {
        let value: Value = serde_yaml::from_str(
            "a: 'true'\nb: '123'\nc: ''\nd: 'x: y'\ne: plain text\nf: '1.2.3'\ng: '-'\n",
        )
        .unwrap();
        let out = emit_value(&value);
        assert_eq!(
            out,
            "a: \"true\"\nb: \"123\"\nc: \"\"\nd: \"x: y\"\ne: plain text\nf: \"1.2.3\"\ng: \"-\"\n"
        );
        let back: Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_multiline_strings_use_literal_blocks() {
        let value: Value = serde_yaml::from_str(
            "data:\n  script: \"echo a\\n\\necho b\\n\"\n  keep: \"x\\n\\n\"\n  strip: \"x\\ny\"\n",
        )
        .unwrap();
        let out = emit_value(&value);
        assert_eq!(
            out,
            "data:\n  script: |\n    echo a\n\n    echo b\n  keep: |+\n    x\n\n  strip: |-\n    x\n    y\n"
        );
        let back: Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_empty_collections_and_nulls() {
        let out = emit("a: {}\nb: []\nc:\nd: ~\n");
        assert_eq!(out, "a: {}\nb: []\nc:\nd: null\n");
    }

    #[test]
    fn test_nested_sequences() {
        let yaml = "matrix:\n- - 1\n  - 2\n- - 3\n";
        let out = emit(yaml);
        assert_eq!(out, yaml);
    }

    #[test]
    fn test_as_list_item() {
        let block = "# note\napiVersion: v1\nkind: ConfigMap\n";
        assert_eq!(
            as_list_item(block),
            "# note\n- apiVersion: v1\n  kind: ConfigMap\n"
        );
    }

    #[test]
    fn test_quote_styles_survive() {
        let out = emit("a: 'single'\nb: \"double\"\nc: plain\n");
        assert_eq!(out, "a: 'single'\nb: \"double\"\nc: plain\n");
    }
}
