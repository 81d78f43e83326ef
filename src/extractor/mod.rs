
use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tracing::debug;

use crate::{RagError, Result};

/// Document formats the pipeline can read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    Pdf,
    /// Markdown; heading lines are kept so the chunker can split on them
    StructuredText,
    PlainText,
}

impl DocumentFormat {
    /// Determine the format from a file extension (case-insensitive)
    #[inline]
    pub fn from_filename(file_name: &str) -> Result<Self> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("pdf") => Ok(Self::Pdf),
            Some("md" | "markdown") => Ok(Self::StructuredText),
            Some("txt" | "text") => Ok(Self::PlainText),
            Some(other) => Err(RagError::UnsupportedFormat(format!(
                "{} (.{})",
                file_name, other
            ))),
            None => Err(RagError::UnsupportedFormat(file_name.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub title: String,
    pub text: String,
}

/// Title used for a document: its base filename without the extension
#[inline]
pub fn title_from_filename(file_name: &str) -> String {
    let path = Path::new(file_name);
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}

/// Extract plain text from raw document bytes
#[inline]
pub fn extract(file_name: &str, bytes: &[u8], format: DocumentFormat) -> Result<ExtractedDocument> {
    let text = match format {
        DocumentFormat::Pdf => extract_pdf(file_name, bytes)?,
        DocumentFormat::StructuredText => markdown_to_text(&decode_utf8(file_name, bytes)?),
        DocumentFormat::PlainText => decode_utf8(file_name, bytes)?,
    };

    debug!(
        "Extracted {} chars from {} ({:?})",
        text.len(),
        file_name,
        format
    );

    Ok(ExtractedDocument {
        title: title_from_filename(file_name),
        text,
    })
}

fn decode_utf8(file_name: &str, bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|e| RagError::Extraction {
        file: file_name.to_string(),
        message: format!("invalid UTF-8: {}", e),
    })
}

fn extract_pdf(file_name: &str, bytes: &[u8]) -> Result<String> {
    // The parser state lives entirely inside this call and is dropped on
    // every path out of it, including a panic inside the parser.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem(bytes)
    }));

    match outcome {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(RagError::Extraction {
            file: file_name.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Err(RagError::Extraction {
            file: file_name.to_string(),
            message: "PDF parser panicked".to_string(),
        }),
    }
}

/// Render markdown as plain text, keeping ATX heading lines (`# Title`)
/// and separating blocks with blank lines
#[inline]
pub fn markdown_to_text(markdown: &str) -> String {
    let mut output = String::new();
    let mut current = String::new();
    let mut in_code_block = false;

    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                flush_block(&mut output, &mut current);
                current.push_str(&"#".repeat(heading_depth(level)));
                current.push(' ');
            }
            Event::Start(Tag::CodeBlock(_)) => {
                flush_block(&mut output, &mut current);
                in_code_block = true;
            }
            Event::Start(Tag::Item) => {
                if !current.is_empty() && !current.ends_with('\n') {
                    current.push('\n');
                }
                current.push_str("- ");
            }
            Event::End(TagEnd::Heading(_) | TagEnd::Paragraph | TagEnd::List(_)) => {
                flush_block(&mut output, &mut current);
            }
            Event::End(TagEnd::CodeBlock) => {
                in_code_block = false;
                flush_block(&mut output, &mut current);
            }
            Event::Text(text) => {
                current.push_str(&text);
            }
            Event::Code(code) => {
                current.push_str(&code);
            }
            Event::SoftBreak | Event::HardBreak => {
                current.push(if in_code_block { '\n' } else { ' ' });
            }
            _ => {}
        }
    }
    flush_block(&mut output, &mut current);

    output
}

fn flush_block(output: &mut String, current: &mut String) {
    let block = current.trim();
    if !block.is_empty() {
        if !output.is_empty() {
            output.push_str("\n\n");
        }
        output.push_str(block);
    }
    current.clear();
}

fn heading_depth(level: HeadingLevel) -> usize {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}
