//! Single-pass scanner over template text.
//!
//! At every position the regions are tried in a fixed order: comments, single
//! quoted strings, double quoted identifiers, dollar-quoted blocks, `::type`
//! casts, and only then `:name` parameters. Nothing inside a matched region is
//! ever treated as a parameter. Regions that are never closed run to the end
//! of the input.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokenized {
    /// Executable SQL with `$N` placeholders and without comments.
    pub body: String,
    /// Unique lower-cased parameter names; `$N` refers to `params[N - 1]`.
    pub params: Vec<String>,
    /// Comment text in source order, one comment per line.
    pub comments: String,
}

pub fn tokenize(src: &str) -> Tokenized {
    Lexer::new(src).run()
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    out: Tokenized,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_special(b: u8) -> bool {
    matches!(b, b'-' | b'/' | b'\'' | b'"' | b'$' | b':')
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            out: Tokenized {
                body: String::with_capacity(src.len()),
                ..Default::default()
            },
        }
    }

    fn run(mut self) -> Tokenized {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'-' if self.peek(1) == Some(b'-') => self.line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.block_comment(),
                q @ (b'\'' | b'"') => self.quoted(q),
                b'$' => self.dollar_quoted(),
                b':' => self.colon(),
                _ => self.plain(),
            }
        }
        self.out
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn ident_end(&self, from: usize) -> usize {
        let mut i = from;
        while i < self.bytes.len() && is_ident_char(self.bytes[i]) {
            i += 1;
        }
        i
    }

    fn copy_to(&mut self, end: usize) {
        self.out.body.push_str(&self.src[self.pos..end]);
        self.pos = end;
    }

    fn push_comment(&mut self, text: &str) {
        self.out.comments.push_str(text);
        self.out.comments.push('\n');
    }

    /// Copies one special byte, or a run of ordinary text up to the next one.
    fn plain(&mut self) {
        let mut end = self.pos + 1;
        if !is_special(self.bytes[self.pos]) {
            while end < self.bytes.len() && !is_special(self.bytes[end]) {
                end += 1;
            }
        }
        self.copy_to(end);
    }

    fn line_comment(&mut self) {
        let start = self.pos + 2;
        match self.src[start..].find('\n') {
            Some(offset) => {
                let end = start + offset;
                self.push_comment(&self.src[start..end]);
                self.out.body.push('\n');
                self.pos = end + 1;
            }
            None => {
                self.push_comment(&self.src[start..]);
                self.pos = self.bytes.len();
            }
        }
    }

    fn block_comment(&mut self) {
        let start = self.pos + 2;
        let (text_end, next) = match self.src[start..].find("*/") {
            Some(offset) => (start + offset, start + offset + 2),
            None => (self.bytes.len(), self.bytes.len()),
        };
        self.push_comment(&self.src[start..text_end]);
        self.out.body.push(' ');
        self.pos = next;
    }

    /// `'...'` or `"..."` with backslash escapes, copied verbatim.
    fn quoted(&mut self, quote: u8) {
        let mut i = self.pos + 1;
        let mut end = self.bytes.len();
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'\\' => i += 2,
                b if b == quote => {
                    end = i + 1;
                    break;
                }
                _ => i += 1,
            }
        }
        self.copy_to(end);
    }

    /// `$tag$ ... $tag$` where the closing tag must equal the opening one.
    /// A `$` that does not open a block is ordinary text.
    fn dollar_quoted(&mut self) {
        let tag_start = self.pos + 1;
        let tag_end = match self.bytes.get(tag_start) {
            Some(&b) if is_ident_start(b) => self.ident_end(tag_start),
            _ => tag_start,
        };
        if self.bytes.get(tag_end) != Some(&b'$') {
            self.plain();
            return;
        }

        let delimiter = &self.src[self.pos..=tag_end];
        let body_start = tag_end + 1;
        let end = match self.src[body_start..].find(delimiter) {
            Some(offset) => body_start + offset + delimiter.len(),
            None => self.bytes.len(),
        };
        self.copy_to(end);
    }

    fn colon(&mut self) {
        match self.peek(1) {
            Some(b':') => {
                let end = self.ident_end(self.pos + 2);
                self.copy_to(end);
            }
            Some(b) if is_ident_start(b) => {
                let end = self.ident_end(self.pos + 1);
                let name = self.src[self.pos + 1..end].to_ascii_lowercase();
                let index = match self.out.params.iter().position(|p| *p == name) {
                    Some(i) => i + 1,
                    None => {
                        self.out.params.push(name);
                        self.out.params.len()
                    }
                };
                self.out.body.push('$');
                self.out.body.push_str(&index.to_string());
                self.pos = end;
            }
            _ => self.plain(),
        }
    }
}
