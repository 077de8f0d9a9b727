//! Content key definitions.
//!
//! A [`ContentKey`] identifies *what* a block renders to, independent of *where* it sits in the
//! document. Two equal keys must render pixel-identically under the same theme, so every layout
//! input that influences the output is folded into the key.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Identifies the rendered appearance of a block attachment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentKey {
    /// A fenced or indented code block.
    CodeBlock {
        code_hash: u64,
        code_len: usize,
        language: Option<String>,
        highlighted: bool,
        width: u32,
        inside_quote: bool,
    },
    /// A table, keyed by the hash of its header and row data.
    Table {
        data_hash: u64,
        width: u32,
        inside_quote: bool,
    },
    /// A block quote, keyed by its styled text and nested attachments.
    Quote {
        text_hash: u64,
        attachments_hash: u64,
        width: u32,
        inside_quote: bool,
    },
    /// A horizontal rule.
    Rule { width: u32, inside_quote: bool },
    /// An inline or block image at a given display size.
    Image {
        source_hash: u64,
        target: (u32, u32),
        inside_quote: bool,
    },
}

impl ContentKey {
    pub fn code_block(
        code: &str,
        language: Option<&str>,
        highlighted: bool,
        width: f64,
        inside_quote: bool,
    ) -> Self {
        Self::CodeBlock {
            code_hash: hash_value(&code),
            code_len: code.len(),
            language: language.map(str::to_string),
            highlighted,
            width: round_width(width),
            inside_quote,
        }
    }

    pub fn table<T: Hash>(data: &T, width: f64, inside_quote: bool) -> Self {
        Self::Table {
            data_hash: hash_value(data),
            width: round_width(width),
            inside_quote,
        }
    }

    pub fn quote<T: Hash, A: Hash>(text: &T, attachments: &A, width: f64, inside_quote: bool) -> Self {
        Self::Quote {
            text_hash: hash_value(text),
            attachments_hash: hash_value(attachments),
            width: round_width(width),
            inside_quote,
        }
    }

    pub fn rule(width: f64, inside_quote: bool) -> Self {
        Self::Rule {
            width: round_width(width),
            inside_quote,
        }
    }

    pub fn image(source: &str, target_width: f64, target_height: f64, inside_quote: bool) -> Self {
        Self::Image {
            source_hash: hash_value(&source),
            target: (round_width(target_width), round_width(target_height)),
            inside_quote,
        }
    }

    /// Short label used in log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ContentKey::CodeBlock { .. } => "code_block",
            ContentKey::Table { .. } => "table",
            ContentKey::Quote { .. } => "quote",
            ContentKey::Rule { .. } => "rule",
            ContentKey::Image { .. } => "image",
        }
    }
}

// ============================================================================
// Hash Utilities
// ============================================================================

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Round a layout width to whole points; negative and non-finite widths collapse to zero.
pub fn round_width(width: f64) -> u32 {
    if !width.is_finite() || width <= 0.0 {
        return 0;
    }
    let rounded = width.round();
    if rounded >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        rounded as u32
    }
}
