
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::SplitWhitespace;
use std::sync::LazyLock;

/// Korean regulation structure markers: 제1장 (chapter), 제2절 (section), 제3조 (article),
/// optionally followed by a parenthesised title such as 제3조(대여기간)
static ARTICLE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t]*(제[ \t]*\d+[ \t]*(장|절|조)(?:의[ \t]*\d+)?)(?![가-힣])(?:[ \t]*(\([^)\n]*\)|（[^）\n]*）))?")
        .expect("article marker pattern is valid")
});

/// Represents a chunk of text ready for classification and embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Document title, or the heading the chunk sits under
    pub title: String,
    /// Trimmed, non-empty chunk text
    pub content: String,
    /// Heading path, e.g. "제2장 대여 > 제3조(대여기간)"
    pub section: Option<String>,
}

/// Chunk size bounds, measured in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// A chunk is closed once it reaches this size and the next token does not fit
    pub min_chunk_size: usize,
    /// Hard upper bound for every chunk
    pub max_chunk_size: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            min_chunk_size: 200,
            max_chunk_size: 1000,
        }
    }
}

/// Split a document into chunks in reading order.
///
/// Text containing heading markers is split on headings first and any
/// section longer than the maximum is re-split by size. Other text is
/// split by size only. The returned iterator is lazy and can be cloned to
/// restart from the current position.
///
/// Tokens are only cut when a single token is longer than the maximum. A
/// chunk before such a token, or before a token that would otherwise need
/// cutting, may close under the minimum.
#[inline]
pub fn chunk_text<'a>(text: &'a str, title: &'a str, config: &ChunkingConfig) -> Chunks<'a> {
    let config = *config;

    if has_heading_markers(text) {
        Chunks {
            doc_title: title,
            config,
            sections: Some(Sections::new(text)),
            current: None,
        }
    } else {
        Chunks {
            doc_title: title,
            config,
            sections: None,
            current: Some(SectionChunks {
                title: title.to_string(),
                section: None,
                windows: Windows::new(text.trim(), &config),
            }),
        }
    }
}

/// Whether any line of the text is a markdown heading or a regulation article marker
#[inline]
pub fn has_heading_markers(text: &str) -> bool {
    text.lines().any(|line| parse_heading(line).is_some())
}

#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    doc_title: &'a str,
    config: ChunkingConfig,
    sections: Option<Sections<'a>>,
    current: Option<SectionChunks<'a>>,
}

#[derive(Debug, Clone)]
struct SectionChunks<'a> {
    title: String,
    section: Option<String>,
    windows: Windows<'a>,
}

impl Iterator for Chunks<'_> {
    type Item = TextChunk;

    fn next(&mut self) -> Option<TextChunk> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(content) = current.windows.next() {
                    return Some(TextChunk {
                        title: current.title.clone(),
                        content,
                        section: current.section.clone(),
                    });
                }
                self.current = None;
            }

            let section = self.sections.as_mut()?.next()?;
            let body = section.body.trim();
            if body.is_empty() {
                continue;
            }

            self.current = Some(SectionChunks {
                title: section
                    .heading
                    .unwrap_or_else(|| self.doc_title.to_string()),
                section: section.path,
                windows: Windows::new(body, &self.config),
            });
        }
    }
}

/// A heading-delimited span of the source text
#[derive(Debug, Clone, PartialEq, Eq)]
struct Section<'a> {
    path: Option<String>,
    heading: Option<String>,
    body: &'a str,
}

#[derive(Debug, Clone)]
struct Sections<'a> {
    rest: &'a str,
    stack: Vec<(u8, String)>,
    done: bool,
}

impl<'a> Sections<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            rest: text,
            stack: Vec::new(),
            done: false,
        }
    }

    fn current_path(&self) -> Option<String> {
        if self.stack.is_empty() {
            None
        } else {
            Some(
                self.stack
                    .iter()
                    .map(|(_, heading)| heading.as_str())
                    .collect::<Vec<_>>()
                    .join(" > "),
            )
        }
    }

    fn push_heading(&mut self, level: u8, heading: String) {
        while self.stack.last().is_some_and(|(l, _)| *l >= level) {
            self.stack.pop();
        }
        self.stack.push((level, heading));
    }
}

impl<'a> Iterator for Sections<'a> {
    type Item = Section<'a>;

    fn next(&mut self) -> Option<Section<'a>> {
        if self.done {
            return None;
        }

        let rest = self.rest;
        let mut offset = 0;
        let mut next_heading = None;

        for line in rest.split_inclusive('\n') {
            if let Some(heading) = parse_heading(line) {
                next_heading = Some((offset, heading));
                break;
            }
            offset += line.len();
        }

        let section = Section {
            path: self.current_path(),
            heading: self.stack.last().map(|(_, heading)| heading.clone()),
            body: rest.get(..offset).unwrap_or(rest),
        };

        match next_heading {
            Some((line_start, heading)) => {
                self.rest = rest.get(line_start + heading.consumed..).unwrap_or_default();
                self.push_heading(heading.level, heading.text);
            }
            None => self.done = true,
        }

        Some(section)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Heading {
    level: u8,
    text: String,
    /// Bytes of the line taken by the marker; the remainder is body text
    consumed: usize,
}

fn parse_heading(line: &str) -> Option<Heading> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();

    if (1..=6).contains(&hashes) {
        let after = trimmed.get(hashes..).unwrap_or_default();
        if after.starts_with([' ', '\t']) {
            let text = after.trim().trim_end_matches('#').trim();
            if !text.is_empty() {
                return Some(Heading {
                    level: hashes as u8,
                    text: text.to_string(),
                    consumed: line.len(),
                });
            }
        }
        return None;
    }

    let captures = ARTICLE_MARKER.captures(line).ok().flatten()?;
    let level = match captures.get(2).map(|m| m.as_str()) {
        Some("장") => 1,
        Some("절") => 2,
        _ => 3,
    };

    // Chapter and section lines are pure headings; article bodies start on the marker line
    if level < 3 {
        return Some(Heading {
            level,
            text: line.split_whitespace().collect::<Vec<_>>().join(" "),
            consumed: line.len(),
        });
    }

    let whole = captures.get(0)?;
    let marker = captures.get(1)?.as_str().split_whitespace().collect::<String>();
    let text = match captures.get(3) {
        Some(title) => format!("{}{}", marker, title.as_str().trim()),
        None => marker,
    };

    Some(Heading {
        level,
        text,
        consumed: whole.end(),
    })
}

/// Size-based sliding window over whitespace-delimited tokens
#[derive(Debug, Clone)]
struct Windows<'a> {
    /// Set when the whole text already fits in one chunk
    whole: Option<&'a str>,
    tokens: SplitWhitespace<'a>,
    carry: Option<&'a str>,
    min: usize,
    max: usize,
}

impl<'a> Windows<'a> {
    fn new(text: &'a str, config: &ChunkingConfig) -> Self {
        let whole = (!text.is_empty() && text.chars().count() <= config.max_chunk_size)
            .then_some(text);

        Self {
            whole,
            tokens: if whole.is_some() {
                "".split_whitespace()
            } else {
                text.split_whitespace()
            },
            carry: None,
            min: config.min_chunk_size,
            max: config.max_chunk_size,
        }
    }
}

impl Iterator for Windows<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if let Some(whole) = self.whole.take() {
            return Some(whole.to_string());
        }

        let mut current = String::new();
        let mut len = 0;

        while let Some(token) = self.carry.take().or_else(|| self.tokens.next()) {
            let token_len = token.chars().count();
            let sep = usize::from(len > 0);

            if len + sep + token_len <= self.max {
                if sep == 1 {
                    current.push(' ');
                }
                current.push_str(token);
                len += sep + token_len;
                continue;
            }

            if len >= self.min {
                self.carry = Some(token);
                break;
            }

            // Undersized: close early rather than cut a token that fits a chunk of its own
            if len > 0 && token_len <= self.max {
                self.carry = Some(token);
                break;
            }

            // The token alone exceeds the maximum: fill to the maximum and carry the rest
            let room = self.max - len - sep;
            let split_at = token
                .char_indices()
                .nth(room)
                .map_or(token.len(), |(idx, _)| idx);
            let (head, tail) = token.split_at(split_at);
            if sep == 1 {
                current.push(' ');
            }
            current.push_str(head);
            if !tail.is_empty() {
                self.carry = Some(tail);
            }
            break;
        }

        (!current.is_empty()).then_some(current)
    }
}
