use serde_json::{Map, Value};

/// Incremental JSON reader for streamed tool arguments.
///
/// Chunks are scanned once and the container stack is kept between calls,
/// so growing the buffer never re-reads earlier bytes. [`PartialJson::snapshot`]
/// materializes the best value available so far: open containers are closed,
/// a string in progress is kept as-is, and a key without a value (or a
/// half-written number/literal) is left out.
#[derive(Debug, Default)]
pub struct PartialJson {
    stack: Vec<Frame>,
    expect: Expect,
    string: Option<PartialString>,
    scalar: Option<String>,
    root: Option<Value>,
    failed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Expect {
    #[default]
    Value,
    ValueOrClose,
    KeyOrClose,
    Key,
    Colon,
    CommaOrClose,
    End,
}

#[derive(Debug)]
enum Frame {
    Object {
        map: Map<String, Value>,
        key: Option<String>,
    },
    Array(Vec<Value>),
}

#[derive(Debug, Default)]
struct PartialString {
    buf: String,
    is_key: bool,
    escape: Escape,
    high_surrogate: Option<u32>,
}

#[derive(Debug, Default)]
enum Escape {
    #[default]
    Idle,
    Backslash,
    Unicode(String),
}

#[derive(Debug)]
struct Malformed;

impl PartialJson {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) {
        for ch in chunk.chars() {
            if self.failed {
                return;
            }
            if self.step(ch).is_err() {
                self.failed = true;
            }
        }
    }

    /// True once the input can no longer become valid JSON.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn is_complete(&self) -> bool {
        !self.failed && self.root.is_some() && self.scalar.is_none()
    }

    pub fn snapshot(&self) -> Option<Value> {
        if self.failed {
            return None;
        }
        if let Some(root) = self.root.as_ref() {
            return Some(root.clone());
        }

        let mut carry = self
            .string
            .as_ref()
            .filter(|string| !string.is_key)
            .map(|string| Value::String(string.buf.clone()));
        for frame in self.stack.iter().rev() {
            let value = match frame {
                Frame::Object { map, key } => {
                    let mut map = map.clone();
                    if let (Some(key), Some(value)) = (key.as_ref(), carry.take()) {
                        map.insert(key.clone(), value);
                    }
                    Value::Object(map)
                }
                Frame::Array(items) => {
                    let mut items = items.clone();
                    items.extend(carry.take());
                    Value::Array(items)
                }
            };
            carry = Some(value);
        }
        carry
    }

    fn step(&mut self, ch: char) -> Result<(), Malformed> {
        if let Some(string) = self.string.as_mut() {
            if string.feed(ch)? {
                if let Some(done) = self.string.take() {
                    self.finish_string(done)?;
                }
            }
            return Ok(());
        }

        if let Some(mut raw) = self.scalar.take() {
            if is_scalar_char(ch) {
                raw.push(ch);
                self.scalar = Some(raw);
                return Ok(());
            }
            let value = serde_json::from_str::<Value>(&raw).map_err(|_| Malformed)?;
            self.complete(value)?;
        }

        if matches!(ch, ' ' | '\t' | '\n' | '\r') {
            return Ok(());
        }

        match (self.expect, ch) {
            (Expect::Value | Expect::ValueOrClose, '{') => {
                self.stack.push(Frame::Object {
                    map: Map::new(),
                    key: None,
                });
                self.expect = Expect::KeyOrClose;
            }
            (Expect::Value | Expect::ValueOrClose, '[') => {
                self.stack.push(Frame::Array(Vec::new()));
                self.expect = Expect::ValueOrClose;
            }
            (Expect::Value | Expect::ValueOrClose, '"') => {
                self.string = Some(PartialString::default());
            }
            (Expect::Value | Expect::ValueOrClose, c) if is_scalar_start(c) => {
                self.scalar = Some(c.to_string());
            }
            (Expect::ValueOrClose | Expect::CommaOrClose, ']') => self.close(']')?,
            (Expect::KeyOrClose | Expect::CommaOrClose, '}') => self.close('}')?,
            (Expect::KeyOrClose | Expect::Key, '"') => {
                self.string = Some(PartialString {
                    is_key: true,
                    ..PartialString::default()
                });
            }
            (Expect::Colon, ':') => self.expect = Expect::Value,
            (Expect::CommaOrClose, ',') => {
                self.expect = match self.stack.last() {
                    Some(Frame::Object { .. }) => Expect::Key,
                    _ => Expect::Value,
                };
            }
            _ => return Err(Malformed),
        }
        Ok(())
    }

    fn finish_string(&mut self, done: PartialString) -> Result<(), Malformed> {
        if !done.is_key {
            return self.complete(Value::String(done.buf));
        }
        match self.stack.last_mut() {
            Some(Frame::Object { key, .. }) => *key = Some(done.buf),
            _ => return Err(Malformed),
        }
        self.expect = Expect::Colon;
        Ok(())
    }

    fn close(&mut self, ch: char) -> Result<(), Malformed> {
        let value = match (self.stack.pop(), ch) {
            (Some(Frame::Object { map, key: None }), '}') => Value::Object(map),
            (Some(Frame::Array(items)), ']') => Value::Array(items),
            _ => return Err(Malformed),
        };
        self.complete(value)
    }

    fn complete(&mut self, value: Value) -> Result<(), Malformed> {
        match self.stack.last_mut() {
            None => {
                self.root = Some(value);
                self.expect = Expect::End;
            }
            Some(Frame::Object { map, key }) => {
                let key = key.take().ok_or(Malformed)?;
                map.insert(key, value);
                self.expect = Expect::CommaOrClose;
            }
            Some(Frame::Array(items)) => {
                items.push(value);
                self.expect = Expect::CommaOrClose;
            }
        }
        Ok(())
    }
}

impl PartialString {
    /// Returns true when `ch` closed the string.
    fn feed(&mut self, ch: char) -> Result<bool, Malformed> {
        match std::mem::take(&mut self.escape) {
            Escape::Idle => match ch {
                '"' => {
                    self.flush_surrogate();
                    return Ok(true);
                }
                '\\' => self.escape = Escape::Backslash,
                c => self.push(c),
            },
            Escape::Backslash => {
                let unescaped = match ch {
                    '"' => '"',
                    '\\' => '\\',
                    '/' => '/',
                    'b' => '\u{8}',
                    'f' => '\u{c}',
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    'u' => {
                        self.escape = Escape::Unicode(String::with_capacity(4));
                        return Ok(false);
                    }
                    _ => return Err(Malformed),
                };
                self.push(unescaped);
            }
            Escape::Unicode(mut digits) => {
                if !ch.is_ascii_hexdigit() {
                    return Err(Malformed);
                }
                digits.push(ch);
                if digits.len() < 4 {
                    self.escape = Escape::Unicode(digits);
                    return Ok(false);
                }
                let unit = u32::from_str_radix(&digits, 16).map_err(|_| Malformed)?;
                self.push_code_unit(unit);
            }
        }
        Ok(false)
    }

    fn push(&mut self, ch: char) {
        self.flush_surrogate();
        self.buf.push(ch);
    }

    fn push_code_unit(&mut self, unit: u32) {
        match unit {
            0xD800..=0xDBFF => {
                self.flush_surrogate();
                self.high_surrogate = Some(unit);
            }
            0xDC00..=0xDFFF => {
                let ch = self.high_surrogate.take().and_then(|high| {
                    char::from_u32(0x10000 + ((high - 0xD800) << 10) + (unit - 0xDC00))
                });
                self.buf.push(ch.unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            _ => self.push(char::from_u32(unit).unwrap_or(char::REPLACEMENT_CHARACTER)),
        }
    }

    fn flush_surrogate(&mut self) {
        if self.high_surrogate.take().is_some() {
            self.buf.push(char::REPLACEMENT_CHARACTER);
        }
    }
}

fn is_scalar_start(ch: char) -> bool {
    ch == '-' || ch.is_ascii_digit() || matches!(ch, 't' | 'f' | 'n')
}

fn is_scalar_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.')
}

/// Strict parse of an authoritative argument string. Blank input is an
/// empty object.
pub fn parse_complete(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(raw)
}
