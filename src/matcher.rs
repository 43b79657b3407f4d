//! # Path Matcher
//!
//! Compiles route path strings into matchable segment sequences and decides
//! whether a request path satisfies a registered route.
//!
//! Two pattern forms exist:
//!
//! - **Literal form**: `/`-delimited segments, where a segment may embed one
//!   or more `{name}` placeholders. Each parameterized segment compiles into
//!   its own capture regex; purely literal segments stay exact-compare
//!   strings. Segment count is fixed at compile time.
//! - **Regex form**: a raw regular expression matched against the request
//!   path after a configured prefix is stripped. Regex routes do not extract
//!   named parameters.
//!
//! Matching fails fast: segment-count mismatch and literal mismatches
//! short-circuit before any per-segment regex runs.

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;

/// Extracted path parameters, URL-decoded
pub type Params = HashMap<String, String>;

/// Normalize a raw path: collapse repeated `/`, strip the trailing `/`
/// (except for the root path), ensure a leading `/`.
#[must_use]
pub fn normalize_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 1);
    out.push('/');
    for part in raw.split('/') {
        if part.is_empty() {
            continue;
        }
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Split a normalized path into its segments (root yields zero segments)
#[must_use]
pub fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Basic URL decoding (`+` and `%XX` escapes)
#[must_use]
pub(crate) fn url_decode(s: &str) -> String {
    // Escapes decode to raw bytes first; multi-byte UTF-8 sequences span
    // several escapes, so conversion back to text happens once at the end.
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();

    while let Some(b) = bytes.next() {
        match b {
            b'+' => out.push(b' '),
            b'%' => {
                let hex: Vec<u8> = bytes.by_ref().take(2).collect();
                let decoded = std::str::from_utf8(&hex)
                    .ok()
                    .filter(|h| h.len() == 2)
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match decoded {
                    Some(byte) => out.push(byte),
                    None => {
                        out.push(b'%');
                        out.extend_from_slice(&hex);
                    }
                }
            }
            _ => out.push(b),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// One `/`-delimited token of a compiled route
#[derive(Debug, Clone)]
pub struct Segment {
    /// Raw segment text as written in the pattern
    raw: String,
    /// Parameter names this segment binds (usually zero or one)
    params: Vec<String>,
    /// How the segment is matched against a request segment
    matcher: SegmentMatcher,
}

#[derive(Debug, Clone)]
enum SegmentMatcher {
    /// Exact string compare
    Literal,
    /// One capture regex for all placeholders inside this segment
    Captures(Regex),
}

impl Segment {
    /// Whether this segment binds any parameters
    #[must_use]
    pub fn is_parameterized(&self) -> bool {
        !self.params.is_empty()
    }

    /// Raw segment text
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// The matchable shape of a compiled pattern
#[derive(Debug, Clone)]
enum PathForm {
    /// Ordered literal/parameterized segments
    Segments(Vec<Segment>),
    /// Whole-tail regex after a stripped prefix
    Pattern { regex: Regex, prefix: String },
}

/// A route path compiled for matching
#[derive(Debug, Clone)]
pub struct CompiledPath {
    pattern: String,
    form: PathForm,
}

impl CompiledPath {
    /// Compile a literal-form pattern (segments with `{name}` placeholders)
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRoutePattern`] on unbalanced braces, empty
    /// parameter names, or duplicate parameter names.
    pub fn compile(pattern: &str) -> Result<Self> {
        let normalized = normalize_path(pattern);
        let mut segments = Vec::new();
        let mut seen = Vec::new();

        for raw in normalized.split('/').filter(|s| !s.is_empty()) {
            let segment = compile_segment(pattern, raw)?;
            for name in &segment.params {
                if seen.contains(name) {
                    return Err(Error::InvalidRoutePattern {
                        pattern: pattern.to_string(),
                        reason: format!("duplicate parameter name '{name}'"),
                    });
                }
                seen.push(name.clone());
            }
            segments.push(segment);
        }

        Ok(Self {
            pattern: normalized,
            form: PathForm::Segments(segments),
        })
    }

    /// Compile a regex-form pattern, matched against the request path after
    /// `prefix` is stripped
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRoutePattern`] if the expression is invalid.
    pub fn compile_regex(pattern: &str, prefix: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| Error::InvalidRoutePattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            form: PathForm::Pattern {
                regex,
                prefix: normalize_path(prefix),
            },
        })
    }

    /// Original (normalized) pattern text, used for registry equality and
    /// the built-in 404 listing
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Segment count of a literal-form path; `None` for regex-form
    #[must_use]
    pub fn segment_count(&self) -> Option<usize> {
        match &self.form {
            PathForm::Segments(segs) => Some(segs.len()),
            PathForm::Pattern { .. } => None,
        }
    }

    /// Match a request path against this compiled pattern
    ///
    /// `segments` must be the split form of `path` (the caller splits once
    /// per request and reuses the slice across all candidate routes).
    /// Returns the extracted parameters on success.
    #[must_use]
    pub fn matches(&self, path: &str, segments: &[&str]) -> Option<Params> {
        match &self.form {
            PathForm::Segments(compiled) => {
                if compiled.len() != segments.len() {
                    return None;
                }
                // literal pass first, so no regex runs on obviously-wrong routes
                for (seg, req) in compiled.iter().zip(segments) {
                    if matches!(seg.matcher, SegmentMatcher::Literal) && seg.raw != *req {
                        return None;
                    }
                }
                let mut params = Params::new();
                for (seg, req) in compiled.iter().zip(segments) {
                    if let SegmentMatcher::Captures(re) = &seg.matcher {
                        let caps = re.captures(req)?;
                        for (i, name) in seg.params.iter().enumerate() {
                            let value = caps.get(i + 1)?.as_str();
                            params.insert(name.clone(), url_decode(value));
                        }
                    }
                }
                Some(params)
            }
            PathForm::Pattern { regex, prefix } => {
                let tail = if prefix == "/" {
                    path
                } else {
                    path.strip_prefix(prefix.as_str())?
                };
                regex.is_match(tail).then(Params::new)
            }
        }
    }
}

/// Compile one raw segment into a literal or capture matcher
fn compile_segment(pattern: &str, raw: &str) -> Result<Segment> {
    if !raw.contains('{') && !raw.contains('}') {
        return Ok(Segment {
            raw: raw.to_string(),
            params: Vec::new(),
            matcher: SegmentMatcher::Literal,
        });
    }

    let mut params = Vec::new();
    let mut expr = String::from("^");
    let mut literal = String::new();
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed || name.is_empty() {
                    return Err(Error::InvalidRoutePattern {
                        pattern: pattern.to_string(),
                        reason: format!("malformed placeholder in segment '{raw}'"),
                    });
                }
                params.push(name);
                expr.push_str("([^/]+)");
            }
            '}' => {
                return Err(Error::InvalidRoutePattern {
                    pattern: pattern.to_string(),
                    reason: format!("unbalanced '}}' in segment '{raw}'"),
                });
            }
            _ => literal.push(c),
        }
    }
    expr.push_str(&regex::escape(&literal));
    expr.push('$');

    let regex = Regex::new(&expr).map_err(|e| Error::InvalidRoutePattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    Ok(Segment {
        raw: raw.to_string(),
        params,
        matcher: SegmentMatcher::Captures(regex),
    })
}
