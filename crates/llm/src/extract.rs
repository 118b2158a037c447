//! Streaming answer extraction.
//!
//! Parses a `PlannerAction` JSON document as it streams in. Once
//! `"next_node"` resolves to `final_response` (or the legacy `null`), the
//! extractor locates `args` → `answer`/`raw_answer` and emits decoded text
//! deltas character-by-character (batched per fed chunk) until the
//! unescaped closing quote, then a single `Done` marker. Non-terminal
//! actions stream nothing.
//!
//! The machine is tolerant of arbitrary chunk boundaries: partial keys,
//! split escapes, and split `\uXXXX` sequences all resume on the next feed.

/// Events produced by [`StreamingExtractor::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractEvent {
    /// Decoded answer text (one batch per fed chunk).
    Delta(String),
    /// The answer string closed; emitted exactly once.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Looking for the `"next_node"` key.
    SeekNextNodeKey,
    /// Key found; waiting for its complete value.
    SeekNextNodeValue,
    /// Non-terminal action: never emits anything.
    Inert,
    /// Terminal: looking for `"args"` and its opening brace.
    SeekArgs,
    /// `"args"` seen, still waiting for the opening brace.
    SeekAnswerBrace,
    /// Looking for `"answer"` / `"raw_answer"`.
    SeekAnswerKey,
    /// Looking for the colon and opening quote of the answer value.
    SeekOpenQuote,
    /// Inside the answer string.
    Streaming,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Escape {
    None,
    Backslash,
    Unicode(String),
}

pub struct StreamingExtractor {
    buf: String,
    /// Byte offset of the first unconsumed character in `buf`.
    pos: usize,
    phase: Phase,
    escape: Escape,
    pending_surrogate: Option<u16>,
}

impl StreamingExtractor {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            pos: 0,
            phase: Phase::SeekNextNodeKey,
            escape: Escape::None,
            pending_surrogate: None,
        }
    }

    /// The action has been identified as `final_response`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.phase,
            Phase::SeekArgs
                | Phase::SeekAnswerBrace
                | Phase::SeekAnswerKey
                | Phase::SeekOpenQuote
                | Phase::Streaming
                | Phase::Done
        )
    }

    /// The answer string has closed.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Feed a raw chunk; returns any decoded deltas plus the done marker.
    pub fn feed(&mut self, chunk: &str) -> Vec<ExtractEvent> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();
        let mut delta = String::new();

        loop {
            match self.phase {
                Phase::Inert | Phase::Done => break,
                Phase::SeekNextNodeKey => {
                    match self.rest().find("\"next_node\"") {
                        Some(i) => {
                            self.pos += i + "\"next_node\"".len();
                            self.phase = Phase::SeekNextNodeValue;
                        }
                        None => break,
                    }
                }
                Phase::SeekNextNodeValue => {
                    match self.try_read_node_value() {
                        ReadOutcome::NotReady => break,
                        ReadOutcome::Terminal => self.phase = Phase::SeekArgs,
                        ReadOutcome::NonTerminal => self.phase = Phase::Inert,
                    }
                }
                Phase::SeekArgs => {
                    match self.rest().find("\"args\"") {
                        Some(i) => {
                            let after_key = self.pos + i + "\"args\"".len();
                            match self.buf[after_key..].find('{') {
                                Some(j) => {
                                    self.pos = after_key + j + 1;
                                    self.phase = Phase::SeekAnswerKey;
                                }
                                None => {
                                    // Brace not in the buffer yet; `pos` has
                                    // skipped the key so the next scan starts
                                    // at the colon.
                                    self.pos = after_key;
                                    self.phase = Phase::SeekAnswerBrace;
                                }
                            }
                        }
                        None => break,
                    }
                }
                Phase::SeekAnswerKey => {
                    let rest = self.rest();
                    let answer = rest.find("\"answer\"");
                    let raw = rest.find("\"raw_answer\"");
                    let hit = match (answer, raw) {
                        (Some(a), Some(r)) => Some(if a < r {
                            (a, "\"answer\"".len())
                        } else {
                            (r, "\"raw_answer\"".len())
                        }),
                        (Some(a), None) => Some((a, "\"answer\"".len())),
                        (None, Some(r)) => Some((r, "\"raw_answer\"".len())),
                        (None, None) => None,
                    };
                    match hit {
                        Some((i, len)) => {
                            self.pos += i + len;
                            self.phase = Phase::SeekOpenQuote;
                        }
                        None => break,
                    }
                }
                Phase::SeekOpenQuote => {
                    match self.rest().find(':') {
                        Some(i) => {
                            let after_colon = self.pos + i + 1;
                            match self.buf[after_colon..].find('"') {
                                Some(j) => {
                                    self.pos = after_colon + j + 1;
                                    self.phase = Phase::Streaming;
                                    self.escape = Escape::None;
                                }
                                None => break,
                            }
                        }
                        None => break,
                    }
                }
                Phase::Streaming => {
                    self.stream_chars(&mut delta);
                    if self.phase == Phase::Done {
                        if !delta.is_empty() {
                            events.push(ExtractEvent::Delta(std::mem::take(&mut delta)));
                        }
                        events.push(ExtractEvent::Done);
                    }
                    break;
                }
                Phase::SeekAnswerBrace => {
                    match self.rest().find('{') {
                        Some(i) => {
                            self.pos += i + 1;
                            self.phase = Phase::SeekAnswerKey;
                        }
                        None => break,
                    }
                }
            }
        }

        if !delta.is_empty() {
            events.push(ExtractEvent::Delta(delta));
        }
        events
    }

    fn rest(&self) -> &str {
        &self.buf[self.pos..]
    }

    /// Decode answer characters from the buffer until it runs dry or the
    /// string closes.
    fn stream_chars(&mut self, out: &mut String) {
        while self.pos < self.buf.len() {
            let c = match self.buf[self.pos..].chars().next() {
                Some(c) => c,
                None => break,
            };
            self.pos += c.len_utf8();

            match std::mem::replace(&mut self.escape, Escape::None) {
                Escape::None => match c {
                    '"' => {
                        self.flush_orphan_surrogate(out);
                        self.phase = Phase::Done;
                        return;
                    }
                    '\\' => self.escape = Escape::Backslash,
                    _ => {
                        self.flush_orphan_surrogate(out);
                        out.push(c);
                    }
                },
                Escape::Backslash => match c {
                    'u' => self.escape = Escape::Unicode(String::new()),
                    'n' => self.push_decoded(out, '\n'),
                    't' => self.push_decoded(out, '\t'),
                    'r' => self.push_decoded(out, '\r'),
                    'b' => self.push_decoded(out, '\u{0008}'),
                    'f' => self.push_decoded(out, '\u{000C}'),
                    other => self.push_decoded(out, other),
                },
                Escape::Unicode(mut hex) => {
                    hex.push(c);
                    if hex.len() < 4 {
                        self.escape = Escape::Unicode(hex);
                        continue;
                    }
                    let cp = u16::from_str_radix(&hex, 16).unwrap_or(0xFFFD);
                    match (self.pending_surrogate.take(), cp) {
                        (None, 0xD800..=0xDBFF) => self.pending_surrogate = Some(cp),
                        (Some(high), 0xDC00..=0xDFFF) => {
                            let combined = 0x10000
                                + ((high as u32 - 0xD800) << 10)
                                + (cp as u32 - 0xDC00);
                            out.push(char::from_u32(combined).unwrap_or('\u{FFFD}'));
                        }
                        (pending, cp) => {
                            if pending.is_some() {
                                out.push('\u{FFFD}');
                            }
                            if (0xD800..=0xDFFF).contains(&cp) {
                                // Lone surrogate in either direction.
                                if (0xD800..=0xDBFF).contains(&cp) {
                                    self.pending_surrogate = Some(cp);
                                } else {
                                    out.push('\u{FFFD}');
                                }
                            } else {
                                out.push(char::from_u32(cp as u32).unwrap_or('\u{FFFD}'));
                            }
                        }
                    }
                }
            }
        }
    }

    fn push_decoded(&mut self, out: &mut String, c: char) {
        self.flush_orphan_surrogate(out);
        out.push(c);
    }

    fn flush_orphan_surrogate(&mut self, out: &mut String) {
        if self.pending_surrogate.take().is_some() {
            out.push('\u{FFFD}');
        }
    }

    /// Attempt to read the complete `next_node` value after its key.
    fn try_read_node_value(&mut self) -> ReadOutcome {
        let rest = self.rest();
        let colon = match rest.find(':') {
            Some(i) => i,
            None => return ReadOutcome::NotReady,
        };
        let after = &rest[colon + 1..];
        let (ws_len, first) = match after.char_indices().find(|(_, c)| !c.is_whitespace()) {
            Some((i, c)) => (i, c),
            None => return ReadOutcome::NotReady,
        };
        let value_start = colon + 1 + ws_len;

        if first == '"' {
            // Find the closing quote (node names carry no escapes, but be
            // safe about a stray backslash).
            let inner = &rest[value_start + 1..];
            let mut escaped = false;
            for (i, c) in inner.char_indices() {
                if escaped {
                    escaped = false;
                    continue;
                }
                match c {
                    '\\' => escaped = true,
                    '"' => {
                        let is_final = &inner[..i] == "final_response";
                        let end = value_start + 1 + i + 1;
                        self.pos += end;
                        return if is_final {
                            ReadOutcome::Terminal
                        } else {
                            ReadOutcome::NonTerminal
                        };
                    }
                    _ => {}
                }
            }
            ReadOutcome::NotReady
        } else if first == 'n' {
            let candidate = &rest[value_start..];
            if candidate.len() < 4 {
                ReadOutcome::NotReady
            } else if candidate.starts_with("null") {
                // Legacy spelling of final_response.
                self.pos += value_start + 4;
                ReadOutcome::Terminal
            } else {
                self.pos += value_start;
                ReadOutcome::NonTerminal
            }
        } else {
            self.pos += value_start;
            ReadOutcome::NonTerminal
        }
    }
}

enum ReadOutcome {
    NotReady,
    Terminal,
    NonTerminal,
}

impl Default for StreamingExtractor {
    fn default() -> Self {
        Self::new()
    }
}
