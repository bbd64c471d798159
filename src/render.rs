use std::collections::HashMap;

use once_cell::sync::Lazy;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};

static ENTITIES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("amp", "&"),
        ("lt", "<"),
        ("gt", ">"),
        ("quot", "\""),
        ("#39", "'"),
        ("apos", "'"),
        ("nbsp", " "),
        ("hellip", "…"),
        ("mdash", "—"),
        ("ndash", "–"),
    ])
});

/// Renders the service's rich-text HTML bodies into terminal text. The
/// editor emits a small, well-behaved tag set (paragraphs, headings,
/// emphasis, lists, quotes, code); anything unknown is stripped and its
/// inner text kept.
#[derive(Default)]
pub struct Renderer;

impl Renderer {
    pub fn new() -> Self {
        Self
    }

    pub fn render(&self, input: &str) -> Text<'static> {
        let mut writer = HtmlWriter::default();
        writer.render(input);
        writer.into_text()
    }
}

#[derive(Default)]
struct HtmlWriter {
    lines: Vec<RenderLine>,
    buffer: String,
    bold_depth: usize,
    italic_depth: usize,
    code_depth: usize,
    preformatted: bool,
    heading_level: Option<u8>,
    list_depth: usize,
    ordered_index: Vec<Option<usize>>,
    blockquote_depth: usize,
}

#[derive(Clone)]
enum RenderLine {
    Text(Vec<StyledChunk>),
    Heading { level: u8, text: String },
    Bullet { indent: usize, marker: String, text: String },
    Quote { depth: usize, text: String },
    Code(String),
    Blank,
}

#[derive(Clone)]
struct StyledChunk {
    text: String,
    bold: bool,
    italic: bool,
    code: bool,
}

impl HtmlWriter {
    fn render(&mut self, input: &str) {
        let mut rest = input;
        while let Some(open) = rest.find('<') {
            self.text(&rest[..open]);
            rest = &rest[open..];
            let Some(close) = rest.find('>') else {
                // Unterminated tag: treat the remainder as text.
                self.text(rest);
                rest = "";
                break;
            };
            self.tag(&rest[1..close]);
            rest = &rest[close + 1..];
        }
        self.text(rest);
        self.flush_buffer();
    }

    fn tag(&mut self, raw: &str) {
        let raw = raw.trim();
        let closing = raw.starts_with('/');
        let name = raw
            .trim_start_matches('/')
            .split([' ', '\t', '\n', '/'])
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        match (name.as_str(), closing) {
            ("p", false) | ("div", false) => self.flush_buffer(),
            ("p", true) | ("div", true) => {
                self.flush_buffer();
                self.blank_line();
            }
            ("br", _) => self.flush_buffer(),
            ("h1" | "h2" | "h3" | "h4" | "h5" | "h6", false) => {
                self.flush_buffer();
                self.heading_level = name.as_bytes().get(1).map(|digit| digit - b'0');
            }
            ("h1" | "h2" | "h3" | "h4" | "h5" | "h6", true) => {
                self.flush_buffer();
                self.heading_level = None;
                self.blank_line();
            }
            ("strong" | "b", false) => self.bold_depth += 1,
            ("strong" | "b", true) => self.bold_depth = self.bold_depth.saturating_sub(1),
            ("em" | "i", false) => self.italic_depth += 1,
            ("em" | "i", true) => self.italic_depth = self.italic_depth.saturating_sub(1),
            ("code", false) => self.code_depth += 1,
            ("code", true) => self.code_depth = self.code_depth.saturating_sub(1),
            ("pre", false) => {
                self.flush_buffer();
                self.preformatted = true;
            }
            ("pre", true) => {
                self.flush_buffer();
                self.preformatted = false;
                self.blank_line();
            }
            ("ul", false) => {
                self.flush_buffer();
                self.list_depth += 1;
                self.ordered_index.push(None);
            }
            ("ol", false) => {
                self.flush_buffer();
                self.list_depth += 1;
                self.ordered_index.push(Some(0));
            }
            ("ul" | "ol", true) => {
                self.flush_buffer();
                self.list_depth = self.list_depth.saturating_sub(1);
                self.ordered_index.pop();
                if self.list_depth == 0 {
                    self.blank_line();
                }
            }
            ("li", false) => self.flush_buffer(),
            ("li", true) => self.flush_item(),
            ("blockquote", false) => {
                self.flush_buffer();
                self.blockquote_depth += 1;
            }
            ("blockquote", true) => {
                self.flush_buffer();
                self.blockquote_depth = self.blockquote_depth.saturating_sub(1);
                self.blank_line();
            }
            // Unknown or presentational tag: keep the inner text only.
            _ => {}
        }
    }

    fn text(&mut self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let decoded = decode_entities(raw);
        if self.preformatted {
            for line in decoded.split('\n') {
                self.lines.push(RenderLine::Code(line.to_string()));
            }
            return;
        }
        let collapsed = decoded.replace(['\n', '\r', '\t'], " ");
        if collapsed.trim().is_empty() && self.buffer.is_empty() {
            return;
        }
        self.buffer.push_str(&collapsed);
    }

    fn flush_buffer(&mut self) {
        let text = std::mem::take(&mut self.buffer);
        let text = squeeze_spaces(&text);
        if text.is_empty() {
            return;
        }
        if let Some(level) = self.heading_level {
            self.lines.push(RenderLine::Heading { level, text });
            return;
        }
        if self.blockquote_depth > 0 {
            self.lines.push(RenderLine::Quote {
                depth: self.blockquote_depth,
                text,
            });
            return;
        }
        if self.list_depth > 0 {
            // Bare text inside a list lands under the current item.
            let marker = self.next_marker();
            self.lines.push(RenderLine::Bullet {
                indent: self.list_depth - 1,
                marker,
                text,
            });
            return;
        }
        self.lines.push(RenderLine::Text(vec![StyledChunk {
            text,
            bold: self.bold_depth > 0,
            italic: self.italic_depth > 0,
            code: self.code_depth > 0,
        }]));
    }

    fn flush_item(&mut self) {
        let text = squeeze_spaces(&std::mem::take(&mut self.buffer));
        if text.is_empty() {
            return;
        }
        let marker = self.next_marker();
        self.lines.push(RenderLine::Bullet {
            indent: self.list_depth.saturating_sub(1),
            marker,
            text,
        });
    }

    fn next_marker(&mut self) -> String {
        match self.ordered_index.last_mut() {
            Some(Some(index)) => {
                *index += 1;
                format!("{index}.")
            }
            _ => "•".to_string(),
        }
    }

    fn blank_line(&mut self) {
        if matches!(self.lines.last(), Some(RenderLine::Blank) | None) {
            return;
        }
        self.lines.push(RenderLine::Blank);
    }

    fn into_text(self) -> Text<'static> {
        let mut out: Vec<Line<'static>> = Vec::with_capacity(self.lines.len());
        for line in self.lines {
            match line {
                RenderLine::Text(chunks) => {
                    let spans = chunks
                        .into_iter()
                        .map(|chunk| {
                            let mut style = Style::default();
                            if chunk.bold {
                                style = style.add_modifier(Modifier::BOLD);
                            }
                            if chunk.italic {
                                style = style.add_modifier(Modifier::ITALIC);
                            }
                            if chunk.code {
                                style = style.fg(Color::Yellow);
                            }
                            Span::styled(chunk.text, style)
                        })
                        .collect::<Vec<_>>();
                    out.push(Line::from(spans));
                }
                RenderLine::Heading { level, text } => {
                    let prefix = "#".repeat(level.clamp(1, 6) as usize);
                    out.push(Line::from(Span::styled(
                        format!("{prefix} {text}"),
                        Style::default().add_modifier(Modifier::BOLD),
                    )));
                }
                RenderLine::Bullet {
                    indent,
                    marker,
                    text,
                } => {
                    let pad = "  ".repeat(indent);
                    out.push(Line::from(format!("{pad}{marker} {text}")));
                }
                RenderLine::Quote { depth, text } => {
                    let bars = "> ".repeat(depth);
                    out.push(Line::from(Span::styled(
                        format!("{bars}{text}"),
                        Style::default().fg(Color::DarkGray),
                    )));
                }
                RenderLine::Code(text) => {
                    out.push(Line::from(Span::styled(
                        text,
                        Style::default().fg(Color::Yellow),
                    )));
                }
                RenderLine::Blank => out.push(Line::default()),
            }
        }
        while matches!(out.last(), Some(line) if line.spans.is_empty()) {
            out.pop();
        }
        Text::from(out)
    }
}

fn decode_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp + 1..];
        match rest.find(';') {
            Some(semi) if semi <= 8 => {
                let name = &rest[..semi];
                match ENTITIES.get(name) {
                    Some(replacement) => out.push_str(replacement),
                    None => {
                        out.push('&');
                        out.push_str(name);
                        out.push(';');
                    }
                }
                rest = &rest[semi + 1..];
            }
            _ => out.push('&'),
        }
    }
    out.push_str(rest);
    out
}

fn squeeze_spaces(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = true;
    for ch in input.chars() {
        if ch == ' ' {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim_end().to_string()
}

/// Plain-text reconstruction of a body, used to seed the edit form.
/// Paragraph boundaries come back as blank lines.
pub fn plain_body(html: &str) -> String {
    let text = Renderer::new().render(html);
    let mut out = String::new();
    for line in &text.lines {
        let content: String = line
            .spans
            .iter()
            .map(|span| span.content.as_ref())
            .collect();
        out.push_str(&content);
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Single-line plain-text preview for feed rows.
pub fn plain_excerpt(html: &str, max_chars: usize) -> String {
    let mut stripped = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(open) = rest.find('<') {
        stripped.push_str(&rest[..open]);
        match rest[open..].find('>') {
            Some(close) => {
                stripped.push(' ');
                rest = &rest[open + close + 1..];
            }
            None => {
                rest = "";
                break;
            }
        }
    }
    stripped.push_str(rest);
    let decoded = decode_entities(&stripped);
    let squeezed = squeeze_spaces(&decoded.replace(['\n', '\r', '\t'], " "));
    let trimmed = squeezed.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}
