//! Line-oriented block scanner.
//!
//! Splits markdown into the block-level pieces that become attachments. Inline markup is left
//! untouched; paragraphs are carried through only so callers can count them.

/// A block-level element of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Paragraph(String),
    Code {
        language: Option<String>,
        code: String,
        /// `false` while the closing fence has not streamed in yet.
        closed: bool,
    },
    Table {
        rows: Vec<Vec<String>>,
    },
    Quote(String),
    Rule,
    Image {
        alt: String,
        source: String,
    },
}

impl Block {
    /// Whether the block is rendered as an attachment view.
    pub fn is_attachment(&self) -> bool {
        !matches!(self, Block::Paragraph(_))
    }
}

pub fn scan_blocks(text: &str) -> Vec<Block> {
    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut index = 0;

    while index < lines.len() {
        let line = lines[index];
        let trimmed = line.trim();

        let starts_block = trimmed.starts_with("```")
            || is_rule(trimmed)
            || trimmed.starts_with('>')
            || trimmed.starts_with('|')
            || parse_image(trimmed).is_some();
        if (trimmed.is_empty() || starts_block) && !paragraph.is_empty() {
            blocks.push(Block::Paragraph(paragraph.join("\n")));
            paragraph.clear();
        }

        if trimmed.is_empty() {
            index += 1;
        } else if let Some(info) = trimmed.strip_prefix("```") {
            let language = Some(info.trim())
                .filter(|lang| !lang.is_empty())
                .map(str::to_string);
            let mut code = Vec::new();
            let mut closed = false;
            index += 1;
            while index < lines.len() {
                if lines[index].trim_start().starts_with("```") {
                    closed = true;
                    index += 1;
                    break;
                }
                code.push(lines[index]);
                index += 1;
            }
            blocks.push(Block::Code {
                language,
                code: code.join("\n"),
                closed,
            });
        } else if is_rule(trimmed) {
            blocks.push(Block::Rule);
            index += 1;
        } else if trimmed.starts_with('>') {
            let mut quote = Vec::new();
            while index < lines.len() {
                let Some(rest) = lines[index].trim().strip_prefix('>') else {
                    break;
                };
                quote.push(rest.strip_prefix(' ').unwrap_or(rest));
                index += 1;
            }
            blocks.push(Block::Quote(quote.join("\n")));
        } else if trimmed.starts_with('|') {
            let mut rows = Vec::new();
            while index < lines.len() {
                let row = lines[index].trim();
                if !row.starts_with('|') {
                    break;
                }
                if !is_separator_row(row) {
                    rows.push(split_row(row));
                }
                index += 1;
            }
            blocks.push(Block::Table { rows });
        } else if let Some((alt, source)) = parse_image(trimmed) {
            blocks.push(Block::Image {
                alt: alt.to_string(),
                source: source.to_string(),
            });
            index += 1;
        } else {
            paragraph.push(line);
            index += 1;
        }
    }

    if !paragraph.is_empty() {
        blocks.push(Block::Paragraph(paragraph.join("\n")));
    }
    blocks
}

fn is_rule(line: &str) -> bool {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    compact.len() >= 3
        && ['-', '*', '_']
            .iter()
            .any(|marker| compact.chars().all(|c| c == *marker))
}

fn is_separator_row(row: &str) -> bool {
    row.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn split_row(row: &str) -> Vec<String> {
    let inner = row.strip_prefix('|').unwrap_or(row);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

fn parse_image(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("![")?;
    let (alt, rest) = rest.split_once("](")?;
    let source = rest.strip_suffix(')')?;
    let source = source.split_whitespace().next()?;
    Some((alt, source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_every_block_kind() {
        let text = "\
Intro line
still intro

```rust
fn main() {}
```

| a | b |
|---|---|
| 1 | 2 |

> quoted
> twice

---

![logo](https://example.com/logo.png \"title\")
";
        let blocks = scan_blocks(text);
        assert_eq!(
            blocks,
            vec![
                Block::Paragraph("Intro line\nstill intro".to_string()),
                Block::Code {
                    language: Some("rust".to_string()),
                    code: "fn main() {}".to_string(),
                    closed: true,
                },
                Block::Table {
                    rows: vec![
                        vec!["a".to_string(), "b".to_string()],
                        vec!["1".to_string(), "2".to_string()],
                    ],
                },
                Block::Quote("quoted\ntwice".to_string()),
                Block::Rule,
                Block::Image {
                    alt: "logo".to_string(),
                    source: "https://example.com/logo.png".to_string(),
                },
            ]
        );
    }

    #[test]
    fn unterminated_fence_is_open() {
        let blocks = scan_blocks("```\nlet partial");
        assert_eq!(
            blocks,
            vec![Block::Code {
                language: None,
                code: "let partial".to_string(),
                closed: false,
            }]
        );
    }

    #[test]
    fn paragraphs_are_not_attachments() {
        let blocks = scan_blocks("just text");
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].is_attachment());
        assert!(Block::Rule.is_attachment());
    }
}
