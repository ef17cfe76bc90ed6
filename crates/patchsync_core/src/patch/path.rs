//! Field path parsing.
//!
//! Paths address a location in the entity graph using dots for object keys and
//! brackets for list positions: `board.rows[5].cells[3]`, `players[2].name`.
//! Any segment made only of ASCII digits is treated as a list index, whether it
//! was written `rows[5]` or `rows.5`.

use std::fmt;

use crate::error::{PatchSyncError, Result};

/// One step of a parsed field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Object key
    Key(String),
    /// List position
    Index(usize),
}

impl PathSegment {
    /// Classify a raw segment with the numeric heuristic.
    fn classify(raw: &str, path: &str) -> Result<Self> {
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            raw.parse::<usize>()
                .map(PathSegment::Index)
                .map_err(|_| invalid(path, format!("index '{}' is out of range", raw)))
        } else {
            Ok(PathSegment::Key(raw.to_string()))
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, PathSegment::Index(_))
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => f.write_str(key),
            PathSegment::Index(index) => write!(f, "[{}]", index),
        }
    }
}

fn invalid(path: &str, reason: impl Into<String>) -> PatchSyncError {
    PatchSyncError::InvalidPath {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Split a field path on `.` and `[...]`.
///
/// The empty path addresses the entity root and yields no segments.
pub fn parse_field_path(path: &str) -> Result<Vec<PathSegment>> {
    let mut segments = Vec::new();
    if path.is_empty() {
        return Ok(segments);
    }

    let mut current = String::new();
    // true right after a closing bracket, where a bare key may not follow
    let mut after_bracket = false;
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if current.is_empty() && !after_bracket {
                    return Err(invalid(path, "empty segment"));
                }
                if !current.is_empty() {
                    segments.push(PathSegment::classify(&current, path)?);
                    current.clear();
                }
                after_bracket = false;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::classify(&current, path)?);
                    current.clear();
                }
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return Err(invalid(path, "unclosed '['"));
                }
                let quoted = inner.len() >= 2
                    && (inner.starts_with('"') && inner.ends_with('"')
                        || inner.starts_with('\'') && inner.ends_with('\''));
                if quoted {
                    // quoted keys are never indexes: scores["2"]
                    segments.push(PathSegment::Key(inner[1..inner.len() - 1].to_string()));
                } else if inner.is_empty() {
                    return Err(invalid(path, "empty brackets"));
                } else {
                    segments.push(PathSegment::classify(&inner, path)?);
                }
                after_bracket = true;
            }
            ']' => return Err(invalid(path, "unmatched ']'")),
            _ => {
                if after_bracket {
                    return Err(invalid(path, "expected '.' or '[' after ']'"));
                }
                current.push(c);
            }
        }
    }

    if !current.is_empty() {
        segments.push(PathSegment::classify(&current, path)?);
    } else if path.ends_with('.') {
        return Err(invalid(path, "trailing '.'"));
    }

    Ok(segments)
}

/// Render segments back into canonical path form (`a.b[0].c`).
pub fn format_field_path(segments: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            PathSegment::Key(key) if needs_quoting(key) => {
                out.push_str("[\"");
                out.push_str(key);
                out.push_str("\"]");
            }
            PathSegment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            PathSegment::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
        }
    }
    out
}

fn needs_quoting(key: &str) -> bool {
    key.is_empty()
        || key.bytes().all(|b| b.is_ascii_digit())
        || key.contains(['.', '[', ']'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PathSegment {
        PathSegment::Key(s.to_string())
    }

    #[test]
    fn test_parse_nested_path() {
        let segments = parse_field_path("board.rows[5].cells[3]").unwrap();
        assert_eq!(
            segments,
            vec![
                key("board"),
                key("rows"),
                PathSegment::Index(5),
                key("cells"),
                PathSegment::Index(3)
            ]
        );
    }

    #[test]
    fn test_numeric_dot_segment_is_index() {
        let segments = parse_field_path("players.2.name").unwrap();
        assert_eq!(segments, vec![key("players"), PathSegment::Index(2), key("name")]);
    }

    #[test]
    fn test_leading_bracket_and_quoted_key() {
        let segments = parse_field_path("[0][\"weird.key\"]").unwrap();
        assert_eq!(segments, vec![PathSegment::Index(0), key("weird.key")]);
    }

    #[test]
    fn test_quoted_numeric_key_stays_key() {
        let segments = parse_field_path("scores[\"2\"]").unwrap();
        assert_eq!(segments, vec![key("scores"), key("2")]);
    }

    #[test]
    fn test_empty_path_is_root() {
        assert!(parse_field_path("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_paths() {
        for bad in ["a..b", "a.", ".a", "a[1", "a]", "a[]", "a[0]b"] {
            assert!(parse_field_path(bad).is_err(), "expected error for {bad}");
        }
    }

    #[test]
    fn test_format_roundtrips_canonical_form() {
        let path = "a.b[0].c";
        assert_eq!(format_field_path(&parse_field_path(path).unwrap()), path);
        assert_eq!(
            format_field_path(&parse_field_path("a.0.c").unwrap()),
            "a[0].c"
        );
        let quoted = vec![key("scores"), key("2")];
        assert_eq!(format_field_path(&quoted), "scores[\"2\"]");
        assert_eq!(parse_field_path(&format_field_path(&quoted)).unwrap(), quoted);
    }
}
