//! # Compression Negotiation
//!
//! Selects a response encoding from the `Accept-Encoding` header. The
//! byte-level codecs themselves are collaborators supplied by the caller;
//! this module only decides which algorithm, if any, should wrap the body.
//!
//! Tokens are parsed with optional `;q=` weights. On a weight tie a fixed
//! priority order applies: `br` > `gzip` > `deflate`. An algorithm disabled
//! by configuration is never selected, whatever the client asks for.

use std::sync::Arc;

/// Caller-supplied codec applying a negotiated encoding to body bytes
pub type Compressor = Arc<dyn Fn(ContentEncoding, &[u8]) -> Vec<u8> + Send + Sync>;

/// Content encodings the negotiator understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    /// Brotli
    Brotli,
    /// Gzip
    Gzip,
    /// Deflate
    Deflate,
}

impl ContentEncoding {
    /// Header token for this encoding
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Brotli => "br",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }

    /// Parse a header token
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "br" => Some(Self::Brotli),
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            _ => None,
        }
    }

    /// Tie-break priority (higher wins)
    fn priority(self) -> u8 {
        match self {
            Self::Brotli => 3,
            Self::Gzip => 2,
            Self::Deflate => 1,
        }
    }
}

/// Pick an encoding from an `Accept-Encoding` header value
///
/// Returns `None` when nothing acceptable remains: empty header, all
/// candidates weighted `q=0`, or everything disabled by configuration.
#[must_use]
pub fn negotiate(accept_encoding: &str, disabled: &[ContentEncoding]) -> Option<ContentEncoding> {
    let mut best: Option<(f32, ContentEncoding)> = None;

    for entry in accept_encoding.split(',') {
        let mut parts = entry.split(';');
        let token = parts.next().unwrap_or("").trim();
        if token.is_empty() {
            continue;
        }

        let q = parts
            .find_map(|p| p.trim().strip_prefix("q=").map(str::to_string))
            .and_then(|v| v.parse::<f32>().ok())
            .unwrap_or(1.0);
        if q <= 0.0 {
            continue;
        }

        let candidates: Vec<ContentEncoding> = if token == "*" {
            vec![
                ContentEncoding::Brotli,
                ContentEncoding::Gzip,
                ContentEncoding::Deflate,
            ]
        } else {
            ContentEncoding::from_token(token).into_iter().collect()
        };

        for candidate in candidates {
            if disabled.contains(&candidate) {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_q, best_enc)) => {
                    q > best_q || (q == best_q && candidate.priority() > best_enc.priority())
                }
            };
            if better {
                best = Some((q, candidate));
            }
        }
    }

    best.map(|(_, enc)| enc)
}
