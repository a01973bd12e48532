//! The scanner: turns a buffered byte stream into tokens, interning
//! names and string literals through the global state.
//!
//! Strings created here are anchored as keys of a scanner-owned table
//! registered as a GC root, so a collection in the middle of a parse
//! cannot reclaim them; the anchor is released when the scanner is
//! dropped.

use crate::token::{Span, SpannedToken, Token, RESERVED};
use crate::zio::Zio;
use vesper_core::object::GcRef;
use vesper_core::state::GlobalState;
use vesper_core::value::{str2num, Numeral, TValue};

/// Largest representable line number; exceeding it is a syntax error.
pub const MAX_LINES: u32 = i32::MAX as u32 - 1;

/// A scanner failure: chunk name, line, and a message that includes the
/// offending token text.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{chunk}:{line}: {message}")]
pub struct LexError {
    pub chunk: String,
    pub line: u32,
    pub message: String,
}

/// Pull scanner over a byte stream.
pub struct Lexer<'s> {
    state: &'s mut GlobalState,
    z: Zio<'s>,
    /// Current character, None at end of stream.
    current: Option<u8>,
    /// Raw text of the token being scanned; reused between tokens.
    buff: Vec<u8>,
    line: u32,
    column: u32,
    /// Line of the last consumed token.
    pub lastline: u32,
    chunk_name: String,
    /// Table whose keys anchor every scanner-created string.
    anchor: GcRef,
    t: SpannedToken,
    ahead: Option<SpannedToken>,
    /// Raw text of the most recently scanned token, for error messages.
    pub token_text: String,
}

impl<'s> Lexer<'s> {
    /// Create a scanner over `z` for the chunk called `chunk_name`.
    /// `first` is a character the caller already pulled from the stream
    /// (loaders sniff the first byte to detect binary chunks).
    pub fn new(
        state: &'s mut GlobalState,
        z: Zio<'s>,
        chunk_name: &str,
        first: Option<u8>,
    ) -> Result<Self, LexError> {
        init_reserved(state);
        let anchor = match state.new_table(0, 8) {
            Ok(t) => t,
            Err(e) => {
                return Err(LexError {
                    chunk: chunk_name.to_string(),
                    line: 0,
                    message: e.to_string(),
                })
            }
        };
        state.push_root(anchor);
        let mut lx = Lexer {
            state,
            z,
            current: None,
            buff: Vec::new(),
            line: 1,
            column: 1,
            lastline: 1,
            chunk_name: chunk_name.to_string(),
            anchor,
            t: SpannedToken {
                token: Token::Eof,
                span: Span { line: 1, column: 1 },
            },
            ahead: None,
            token_text: String::new(),
        };
        lx.current = match first {
            Some(c) => Some(c),
            None => lx.z.getc(),
        };
        lx.t = lx.scan()?;
        Ok(lx)
    }

    /// The current token, not yet consumed.
    pub fn current(&self) -> &SpannedToken {
        &self.t
    }

    /// Consume the current token and scan the next one.
    pub fn advance(&mut self) -> Result<SpannedToken, LexError> {
        self.lastline = self.t.span.line;
        let next = match self.ahead.take() {
            Some(tok) => tok,
            None => self.scan()?,
        };
        Ok(std::mem::replace(&mut self.t, next))
    }

    /// Peek one token past the current one. At most one token of
    /// lookahead exists; asking again without consuming is a
    /// programming error.
    pub fn lookahead(&mut self) -> Result<&SpannedToken, LexError> {
        assert!(self.ahead.is_none(), "scanner already has a lookahead token");
        let tok = self.scan()?;
        self.ahead = Some(tok);
        Ok(self.ahead.as_ref().expect("just stored"))
    }

    /// Bytes of a string object produced by this scanner.
    pub fn string_bytes(&self, r: GcRef) -> &[u8] {
        self.state.heap.str_bytes(r)
    }

    // ---- Character primitives ----

    fn next(&mut self) {
        self.current = self.z.getc();
        self.column += 1;
    }

    fn save(&mut self, c: u8) {
        self.buff.push(c);
    }

    fn save_and_next(&mut self) {
        if let Some(c) = self.current {
            self.save(c);
        }
        self.next();
    }

    fn current_is_newline(&self) -> bool {
        matches!(self.current, Some(b'\n') | Some(b'\r'))
    }

    fn check_next1(&mut self, c: u8) -> bool {
        if self.current == Some(c) {
            self.next();
            true
        } else {
            false
        }
    }

    /// If the current char is one of the two in `set`, save and consume
    /// it.
    fn check_next2(&mut self, set: [u8; 2]) -> bool {
        if self.current == Some(set[0]) || self.current == Some(set[1]) {
            self.save_and_next();
            true
        } else {
            false
        }
    }

    /// Skip one newline sequence (`\n`, `\r`, `\n\r`, or `\r\n`) and
    /// bump the line counter.
    fn increment_line(&mut self) -> Result<(), LexError> {
        let old = self.current;
        debug_assert!(self.current_is_newline());
        self.next();
        if self.current_is_newline() && self.current != old {
            self.next();
        }
        self.line += 1;
        self.column = 1;
        if self.line >= MAX_LINES {
            return Err(self.error_at("chunk has too many lines", self.line, None));
        }
        Ok(())
    }

    // ---- Errors ----

    fn error_at(&self, msg: &str, line: u32, near: Option<&str>) -> LexError {
        let message = match near {
            Some(text) => format!("{msg} near '{text}'"),
            None => msg.to_string(),
        };
        LexError {
            chunk: self.chunk_name.clone(),
            line,
            message,
        }
    }

    /// An error quoting the text scanned so far.
    fn err_near<T>(&self, msg: &str, span: Span) -> Result<T, LexError> {
        let raw = if self.buff.len() > 60 {
            &self.buff[..60]
        } else {
            &self.buff[..]
        };
        let near = if raw.is_empty() {
            match self.current {
                Some(c) if c.is_ascii_graphic() || c == b' ' => (c as char).to_string(),
                Some(c) => format!("<\\{c}>"),
                None => "<eof>".to_string(),
            }
        } else {
            String::from_utf8_lossy(raw).into_owned()
        };
        Err(self.error_at(msg, span.line, Some(&near)))
    }

    // ---- Interning ----

    /// Create a string and anchor it against collection for the rest of
    /// the parse.
    fn new_string(&mut self, bytes: &[u8], span: Span) -> Result<GcRef, LexError> {
        let s = self
            .state
            .new_string(bytes)
            .map_err(|e| self.error_at(&e.to_string(), span.line, None))?;
        self.state
            .table_set(self.anchor, TValue::from_obj(s), TValue::from_bool(true))
            .map_err(|e| self.error_at(&e.to_string(), span.line, None))?;
        Ok(s)
    }

    // ---- Scanning ----

    fn scan(&mut self) -> Result<SpannedToken, LexError> {
        loop {
            self.buff.clear();
            let span = Span {
                line: self.line,
                column: self.column,
            };
            let c = match self.current {
                None => {
                    self.token_text = "<eof>".to_string();
                    return Ok(SpannedToken {
                        token: Token::Eof,
                        span,
                    });
                }
                Some(c) => c,
            };
            let token = match c {
                b'\n' | b'\r' => {
                    self.increment_line()?;
                    continue;
                }
                b' ' | b'\t' | b'\x0C' | b'\x0B' => {
                    self.next();
                    continue;
                }
                b'-' => {
                    self.next();
                    if self.current != Some(b'-') {
                        Token::Minus
                    } else {
                        // A comment.
                        self.next();
                        if self.current == Some(b'[') {
                            let sep = self.skip_sep();
                            self.buff.clear();
                            if sep >= 2 {
                                self.read_long_bracket(sep, false, span)?;
                                continue;
                            }
                        }
                        // Short comment: to end of line.
                        while self.current.is_some() && !self.current_is_newline() {
                            self.next();
                        }
                        continue;
                    }
                }
                b'[' => {
                    let sep = self.skip_sep();
                    if sep >= 2 {
                        let s = self
                            .read_long_bracket(sep, true, span)?
                            .expect("string form returns a payload");
                        Token::Str(s)
                    } else if sep == 1 {
                        Token::LBracket
                    } else {
                        return self.err_near("invalid long string delimiter", span);
                    }
                }
                b'=' => {
                    self.next();
                    if self.check_next1(b'=') {
                        Token::Equal
                    } else {
                        Token::Assign
                    }
                }
                b'<' => {
                    self.next();
                    if self.check_next1(b'=') {
                        Token::LessEq
                    } else if self.check_next1(b'<') {
                        Token::ShiftLeft
                    } else {
                        Token::Less
                    }
                }
                b'>' => {
                    self.next();
                    if self.check_next1(b'=') {
                        Token::GreaterEq
                    } else if self.check_next1(b'>') {
                        Token::ShiftRight
                    } else {
                        Token::Greater
                    }
                }
                b'/' => {
                    self.next();
                    if self.check_next1(b'/') {
                        Token::FloorDiv
                    } else {
                        Token::Slash
                    }
                }
                b'~' => {
                    self.next();
                    if self.check_next1(b'=') {
                        Token::NotEqual
                    } else {
                        Token::Tilde
                    }
                }
                b':' => {
                    self.next();
                    if self.check_next1(b':') {
                        Token::DoubleColon
                    } else {
                        Token::Colon
                    }
                }
                b'"' | b'\'' => self.read_string(c, span)?,
                b'.' => {
                    self.save_and_next();
                    if self.check_next1(b'.') {
                        if self.check_next1(b'.') {
                            Token::DotDotDot
                        } else {
                            Token::DotDot
                        }
                    } else if self.current.is_some_and(|c| c.is_ascii_digit()) {
                        self.read_numeral(span)?
                    } else {
                        Token::Dot
                    }
                }
                b'0'..=b'9' => self.read_numeral(span)?,
                _ if is_name_start(c) => {
                    while self.current.is_some_and(is_name_continue) {
                        self.save_and_next();
                    }
                    let bytes = std::mem::take(&mut self.buff);
                    let s = self.new_string(&bytes, span)?;
                    self.buff = bytes;
                    let reserved = self.state.heap.strings.get(s.index).data.reserved();
                    match Token::from_reserved(reserved) {
                        Some(tok) => tok,
                        None => Token::Name(s),
                    }
                }
                b'+' => {
                    self.next();
                    Token::Plus
                }
                b'*' => {
                    self.next();
                    Token::Star
                }
                b'%' => {
                    self.next();
                    Token::Percent
                }
                b'^' => {
                    self.next();
                    Token::Caret
                }
                b'#' => {
                    self.next();
                    Token::Hash
                }
                b'&' => {
                    self.next();
                    Token::Ampersand
                }
                b'|' => {
                    self.next();
                    Token::Pipe
                }
                b'(' => {
                    self.next();
                    Token::LParen
                }
                b')' => {
                    self.next();
                    Token::RParen
                }
                b'{' => {
                    self.next();
                    Token::LBrace
                }
                b'}' => {
                    self.next();
                    Token::RBrace
                }
                b']' => {
                    self.next();
                    Token::RBracket
                }
                b';' => {
                    self.next();
                    Token::Semi
                }
                b',' => {
                    self.next();
                    Token::Comma
                }
                _ => {
                    return self.err_near("unexpected symbol", span);
                }
            };
            self.token_text = if self.buff.is_empty() {
                token.to_string()
            } else {
                String::from_utf8_lossy(&self.buff).into_owned()
            };
            return Ok(SpannedToken { token, span });
        }
    }

    /// Scan a numeral by collecting the liberal pattern and handing it
    /// to `str2num`: hex digits and dots are taken freely; a sign is
    /// taken only right after an exponent mark (`e`/`E`, or `p`/`P` in
    /// the hex form). The leading dot, if any, is already in the
    /// buffer.
    fn read_numeral(&mut self, span: Span) -> Result<Token, LexError> {
        let mut expo = [b'e', b'E'];
        let first = self.current.expect("caller saw a digit");
        debug_assert!(first.is_ascii_digit());
        self.save_and_next();
        if first == b'0' && self.check_next2([b'x', b'X']) {
            expo = [b'p', b'P'];
        }
        loop {
            if self.check_next2(expo) {
                self.check_next2([b'-', b'+']);
            } else if self.current.is_some_and(|c| c.is_ascii_hexdigit()) || self.current == Some(b'.')
            {
                self.save_and_next();
            } else {
                break;
            }
        }
        if self.current.is_some_and(is_name_start) {
            // A numeral touching a letter can never be well formed;
            // include it so the message shows the whole blob.
            self.save_and_next();
        }
        let text = String::from_utf8_lossy(&self.buff).into_owned();
        match str2num(&text) {
            Some(Numeral::Int(i)) => Ok(Token::Integer(i)),
            Some(Numeral::Float(x)) => Ok(Token::Float(x)),
            None => self.err_near("malformed number", span),
        }
    }

    /// Read `[=*[` or `]=*]` up to (not including) the second bracket.
    /// Returns level+2 when well formed, 1 for a lone bracket, 0 for a
    /// broken opener like `[=x`.
    fn skip_sep(&mut self) -> usize {
        let mut count = 0;
        let s = self.current.expect("caller saw a bracket");
        debug_assert!(s == b'[' || s == b']');
        self.save_and_next();
        while self.current == Some(b'=') {
            self.save_and_next();
            count += 1;
        }
        if self.current == Some(s) {
            count + 2
        } else if count == 0 {
            1
        } else {
            0
        }
    }

    /// Scan a long string (returns its payload) or a long comment
    /// (returns None). `sep` is in the level+2 form from `skip_sep`.
    fn read_long_bracket(
        &mut self,
        sep: usize,
        is_string: bool,
        span: Span,
    ) -> Result<Option<GcRef>, LexError> {
        self.save_and_next(); // second '['
        if self.current_is_newline() {
            // The first newline right after the opener is dropped.
            self.increment_line()?;
        }
        loop {
            match self.current {
                None => {
                    let what = if is_string {
                        "unfinished long string"
                    } else {
                        "unfinished long comment"
                    };
                    return self.err_near(what, span);
                }
                Some(b']') => {
                    if self.skip_sep() == sep {
                        self.save_and_next(); // second ']'
                        break;
                    }
                }
                Some(b'\n') | Some(b'\r') => {
                    self.save(b'\n');
                    self.increment_line()?;
                    if !is_string {
                        self.buff.clear(); // don't hoard comment text
                    }
                }
                Some(_) => {
                    if is_string {
                        self.save_and_next();
                    } else {
                        self.next();
                    }
                }
            }
        }
        if !is_string {
            return Ok(None);
        }
        // Trim the delimiters (sep bytes on each side).
        let content = self.buff[sep..self.buff.len() - sep].to_vec();
        let s = self.new_string(&content, span)?;
        Ok(Some(s))
    }

    fn read_hex_digit(&mut self, span: Span) -> Result<u8, LexError> {
        match self.current {
            Some(c) if c.is_ascii_hexdigit() => {
                self.save_and_next();
                Ok(hex_value(c))
            }
            _ => self.err_near("hexadecimal digit expected", span),
        }
    }

    /// Read the body of `\u{XXX}`: at least one hex digit, value capped
    /// at 0x7FFFFFFF (the extended encoding ceiling, beyond the Unicode
    /// range).
    fn read_utf8_escape(&mut self, span: Span) -> Result<u32, LexError> {
        if self.current != Some(b'{') {
            return self.err_near("missing '{' in \\u{xxxx}", span);
        }
        self.save_and_next();
        let mut code: u32 = self.read_hex_digit(span)? as u32;
        while self.current.is_some_and(|c| c.is_ascii_hexdigit()) {
            if code >= 0x0800_0000 {
                return self.err_near("UTF-8 value too large", span);
            }
            let c = self.current.expect("checked");
            self.save_and_next();
            code = code * 16 + hex_value(c) as u32;
        }
        if self.current != Some(b'}') {
            return self.err_near("missing '}' in \\u{xxxx}", span);
        }
        self.save_and_next();
        Ok(code)
    }

    fn read_string(&mut self, quote: u8, span: Span) -> Result<Token, LexError> {
        let mut content: Vec<u8> = Vec::new();
        self.save_and_next(); // opening quote
        loop {
            match self.current {
                None => return self.err_near("unfinished string", span),
                Some(c) if c == quote => {
                    self.save_and_next();
                    break;
                }
                Some(b'\n') | Some(b'\r') => {
                    return self.err_near("unfinished string", span);
                }
                Some(b'\\') => {
                    self.save_and_next();
                    match self.current {
                        None => return self.err_near("unfinished string", span),
                        Some(b'a') => {
                            self.save_and_next();
                            content.push(0x07);
                        }
                        Some(b'b') => {
                            self.save_and_next();
                            content.push(0x08);
                        }
                        Some(b'f') => {
                            self.save_and_next();
                            content.push(0x0C);
                        }
                        Some(b'n') => {
                            self.save_and_next();
                            content.push(b'\n');
                        }
                        Some(b'r') => {
                            self.save_and_next();
                            content.push(b'\r');
                        }
                        Some(b't') => {
                            self.save_and_next();
                            content.push(b'\t');
                        }
                        Some(b'v') => {
                            self.save_and_next();
                            content.push(0x0B);
                        }
                        Some(b'\\') => {
                            self.save_and_next();
                            content.push(b'\\');
                        }
                        Some(b'"') => {
                            self.save_and_next();
                            content.push(b'"');
                        }
                        Some(b'\'') => {
                            self.save_and_next();
                            content.push(b'\'');
                        }
                        Some(b'\n') | Some(b'\r') => {
                            // Escaped line break becomes a newline.
                            self.increment_line()?;
                            content.push(b'\n');
                        }
                        Some(b'x') => {
                            self.save_and_next();
                            let h1 = self.read_hex_digit(span)?;
                            let h2 = self.read_hex_digit(span)?;
                            content.push((h1 << 4) | h2);
                        }
                        Some(b'u') => {
                            self.save_and_next();
                            let code = self.read_utf8_escape(span)?;
                            utf8_encode(code, &mut content);
                        }
                        Some(b'z') => {
                            // Skip the following whitespace run.
                            self.save_and_next();
                            while let Some(c) = self.current {
                                match c {
                                    b'\n' | b'\r' => self.increment_line()?,
                                    b' ' | b'\t' | b'\x0C' | b'\x0B' => self.next(),
                                    _ => break,
                                }
                            }
                        }
                        Some(c) if c.is_ascii_digit() => {
                            // \ddd, up to three decimal digits.
                            let mut val: u32 = 0;
                            for _ in 0..3 {
                                match self.current {
                                    Some(d) if d.is_ascii_digit() => {
                                        val = val * 10 + (d - b'0') as u32;
                                        self.save_and_next();
                                    }
                                    _ => break,
                                }
                            }
                            if val > 255 {
                                return self.err_near("decimal escape too large", span);
                            }
                            content.push(val as u8);
                        }
                        Some(_) => {
                            self.save_and_next();
                            return self.err_near("invalid escape sequence", span);
                        }
                    }
                }
                Some(c) => {
                    self.save_and_next();
                    content.push(c);
                }
            }
        }
        let s = self.new_string(&content, span)?;
        Ok(Token::Str(s))
    }
}

impl Drop for Lexer<'_> {
    fn drop(&mut self) {
        let anchor = self.anchor;
        self.state.pop_root(anchor);
    }
}

/// Intern the reserved words and stamp their `extra` index so the
/// scanner recognizes keywords by identity. Idempotent per state.
fn init_reserved(state: &mut GlobalState) {
    for (i, word) in RESERVED.iter().enumerate() {
        let r = state
            .new_string(word.as_bytes())
            .expect("reserved words are tiny");
        let s = &state.heap.strings.get(r.index).data;
        if s.reserved() == 0 {
            s.set_reserved((i + 1) as u8);
            if state.heap.is_on_allgc(r) {
                state.heap.fix_object(r);
            }
        }
    }
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_name_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => unreachable!("caller checked for a hex digit"),
    }
}

/// Encode a code point as UTF-8, using the extended 1-6 byte form for
/// values above the Unicode range, up to 0x7FFFFFFF.
pub fn utf8_encode(code: u32, buf: &mut Vec<u8>) {
    if code <= 0x7F {
        buf.push(code as u8);
    } else if code <= 0x7FF {
        buf.push(0xC0 | (code >> 6) as u8);
        buf.push(0x80 | (code & 0x3F) as u8);
    } else if code <= 0xFFFF {
        buf.push(0xE0 | (code >> 12) as u8);
        buf.push(0x80 | ((code >> 6) & 0x3F) as u8);
        buf.push(0x80 | (code & 0x3F) as u8);
    } else if code <= 0x1F_FFFF {
        buf.push(0xF0 | (code >> 18) as u8);
        buf.push(0x80 | ((code >> 12) & 0x3F) as u8);
        buf.push(0x80 | ((code >> 6) & 0x3F) as u8);
        buf.push(0x80 | (code & 0x3F) as u8);
    } else if code <= 0x3FF_FFFF {
        buf.push(0xF8 | (code >> 24) as u8);
        buf.push(0x80 | ((code >> 18) & 0x3F) as u8);
        buf.push(0x80 | ((code >> 12) & 0x3F) as u8);
        buf.push(0x80 | ((code >> 6) & 0x3F) as u8);
        buf.push(0x80 | (code & 0x3F) as u8);
    } else {
        buf.push(0xFC | (code >> 30) as u8);
        buf.push(0x80 | ((code >> 24) & 0x3F) as u8);
        buf.push(0x80 | ((code >> 18) & 0x3F) as u8);
        buf.push(0x80 | ((code >> 12) & 0x3F) as u8);
        buf.push(0x80 | ((code >> 6) & 0x3F) as u8);
        buf.push(0x80 | (code & 0x3F) as u8);
    }
}
