//! Span-based rewriting.
//!
//! The rewriter never re-prints the syntax tree. It records edits over byte
//! spans of the original source, renders nested regions on demand (so a hoisted
//! literal carries the rewrites made inside it), and finally stitches the
//! output together with a source map for every run of text copied verbatim.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// ═══════════════════════════════════════════════════════════════════════════════
// PIECES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    /// Bytes `start..end` of the original source.
    Original { start: u32, end: u32 },
    Generated(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pieces(Vec<Piece>);

impl Pieces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(text: impl Into<String>) -> Self {
        let mut pieces = Self::new();
        pieces.push_str(text);
        pieces
    }

    pub fn push_str(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        if let Some(Piece::Generated(last)) = self.0.last_mut() {
            last.push_str(&text);
        } else {
            self.0.push(Piece::Generated(text));
        }
    }

    pub fn push_original(&mut self, start: u32, end: u32) {
        if start < end {
            self.0.push(Piece::Original { start, end });
        }
    }

    pub fn append(&mut self, other: Pieces) {
        for piece in other.0 {
            match piece {
                Piece::Original { start, end } => self.push_original(start, end),
                Piece::Generated(text) => self.push_str(text),
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Piece> {
        self.0.iter()
    }

    /// Flattens to plain text against `source`.
    pub fn to_string(&self, source: &str) -> String {
        let mut out = String::new();
        for piece in &self.0 {
            match piece {
                Piece::Original { start, end } => out.push_str(&source[*start as usize..*end as usize]),
                Piece::Generated(text) => out.push_str(text),
            }
        }
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EDIT BUFFER
// ═══════════════════════════════════════════════════════════════════════════════

/// Edits at the same offset apply in layer order: injected imports, then
/// hoisted registrations, then in-place rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Layer {
    Header,
    Hoist,
    Inline,
}

#[derive(Debug, Clone)]
struct Edit {
    start: u32,
    end: u32,
    layer: Layer,
    seq: usize,
    content: Pieces,
}

pub struct EditBuffer<'s> {
    source: &'s str,
    edits: Vec<Edit>,
    seq: usize,
}

impl<'s> EditBuffer<'s> {
    pub fn new(source: &'s str) -> Self {
        Self {
            source,
            edits: Vec::new(),
            seq: 0,
        }
    }

    fn push(&mut self, start: u32, end: u32, layer: Layer, content: Pieces) {
        self.seq += 1;
        self.edits.push(Edit {
            start,
            end,
            layer,
            seq: self.seq,
            content,
        });
    }

    /// Replaces `start..end`. Inline edits inside the range are discarded; a
    /// caller that wants to keep them renders the range first.
    pub fn overwrite(&mut self, start: u32, end: u32, content: Pieces) {
        self.edits
            .retain(|e| e.layer != Layer::Inline || e.start < start || e.end > end);
        self.push(start, end, Layer::Inline, content);
    }

    pub fn insert(&mut self, at: u32, content: Pieces) {
        self.push(at, at, Layer::Inline, content);
    }

    /// Inserts before the top-level statement starting at `at`.
    pub fn hoist(&mut self, at: u32, content: Pieces) {
        self.push(at, at, Layer::Hoist, content);
    }

    pub fn header(&mut self, at: u32, content: Pieces) {
        self.push(at, at, Layer::Header, content);
    }

    /// `start..end` with the inline edits that fall inside it applied.
    pub fn render(&self, start: u32, end: u32) -> Pieces {
        self.render_layers(start, end, |layer| layer == Layer::Inline)
    }

    /// The whole module with every edit applied.
    pub fn finish(&self) -> Pieces {
        self.render_layers(0, self.source.len() as u32, |_| true)
    }

    fn render_layers(&self, start: u32, end: u32, include: impl Fn(Layer) -> bool) -> Pieces {
        let mut edits: Vec<&Edit> = self
            .edits
            .iter()
            .filter(|e| include(e.layer) && e.start >= start && e.end <= end)
            .collect();
        edits.sort_by(|a, b| match a.start.cmp(&b.start) {
            Ordering::Equal => (a.layer, a.seq).cmp(&(b.layer, b.seq)),
            other => other,
        });

        let mut out = Pieces::new();
        let mut cursor = start;
        for edit in edits {
            if edit.start < cursor {
                continue;
            }
            out.push_original(cursor, edit.start);
            out.append(edit.content.clone());
            cursor = edit.end;
        }
        out.push_original(cursor, end);
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE MAP
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMap {
    pub version: u8,
    pub file: String,
    pub sources: Vec<String>,
    pub sources_content: Vec<String>,
    pub names: Vec<String>,
    pub mappings: String,
}

impl SourceMap {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

const BASE64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn encode_vlq(out: &mut String, value: i64) {
    let mut vlq = if value < 0 { ((-value) << 1) | 1 } else { value << 1 };
    loop {
        let mut digit = (vlq & 0b11111) as usize;
        vlq >>= 5;
        if vlq > 0 {
            digit |= 0b100000;
        }
        out.push(BASE64[digit] as char);
        if vlq == 0 {
            break;
        }
    }
}

/// Line starts of a text, for offset to line/column conversion.
pub struct LineIndex<'s> {
    text: &'s str,
    starts: Vec<usize>,
}

impl<'s> LineIndex<'s> {
    pub fn new(text: &'s str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        Self { text, starts }
    }

    /// Zero-based line and UTF-16 column of a byte offset.
    pub fn position(&self, offset: usize) -> (u32, u32) {
        let line = match self.starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let column = self.text[self.starts[line]..offset].encode_utf16().count();
        (line as u32, column as u32)
    }
}

struct MappingsBuilder {
    mappings: String,
    line: u32,
    column: u32,
    prev_column: i64,
    prev_src_line: i64,
    prev_src_column: i64,
    line_has_segment: bool,
}

impl MappingsBuilder {
    fn new() -> Self {
        Self {
            mappings: String::new(),
            line: 0,
            column: 0,
            prev_column: 0,
            prev_src_line: 0,
            prev_src_column: 0,
            line_has_segment: false,
        }
    }

    fn advance(&mut self, text: &str) {
        for ch in text.chars() {
            if ch == '\n' {
                self.newline();
            } else {
                self.column += ch.len_utf16() as u32;
            }
        }
    }

    fn newline(&mut self) {
        self.mappings.push(';');
        self.line += 1;
        self.column = 0;
        self.prev_column = 0;
        self.line_has_segment = false;
    }

    fn segment(&mut self, src_line: u32, src_column: u32) {
        if self.line_has_segment {
            self.mappings.push(',');
        }
        encode_vlq(&mut self.mappings, self.column as i64 - self.prev_column);
        // Single source, index delta is always zero.
        encode_vlq(&mut self.mappings, 0);
        encode_vlq(&mut self.mappings, src_line as i64 - self.prev_src_line);
        encode_vlq(&mut self.mappings, src_column as i64 - self.prev_src_column);
        self.prev_column = self.column as i64;
        self.prev_src_line = src_line as i64;
        self.prev_src_column = src_column as i64;
        self.line_has_segment = true;
    }
}

/// Produces the output text and its source map.
pub fn emit(pieces: &Pieces, source: &str, file: &str) -> (String, SourceMap) {
    let index = LineIndex::new(source);
    let mut code = String::new();
    let mut builder = MappingsBuilder::new();

    for piece in pieces.iter() {
        match piece {
            Piece::Generated(text) => {
                code.push_str(text);
                builder.advance(text);
            }
            Piece::Original { start, end } => {
                let (start, end) = (*start as usize, *end as usize);
                let text = &source[start..end];
                let (line, column) = index.position(start);
                builder.segment(line, column);
                let mut offset = start;
                for ch in text.chars() {
                    offset += ch.len_utf8();
                    if ch == '\n' {
                        builder.newline();
                        if offset < end {
                            let (line, column) = index.position(offset);
                            builder.segment(line, column);
                        }
                    } else {
                        builder.column += ch.len_utf16() as u32;
                    }
                }
                code.push_str(text);
            }
        }
    }

    let map = SourceMap {
        version: 3,
        file: file.to_string(),
        sources: vec![file.to_string()],
        sources_content: vec![source.to_string()],
        names: vec![],
        mappings: builder.mappings,
    };
    (code, map)
}
