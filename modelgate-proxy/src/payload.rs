//! Extraction of the routing model from the JSON body prefix.
//!
//! The proxy needs the top-level `model` member to pick an admission pool,
//! but must not require the body to fit in memory. The scanner here walks
//! the body chunk by chunk and stops as soon as the member resolves (or the
//! top-level object ends without one); everything past that point streams to
//! the origin unexamined.

use serde::Deserialize;

/// Recognized prefix of a client request body. Unknown members survive
/// untouched because the raw bytes are forwarded verbatim.
#[derive(Debug, Default, Deserialize)]
pub struct RequestPayload {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
}

/// Error types for payload scanning. All of them surface as a 400.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("unable to read request body")]
    Unreadable,

    #[error("request body is not a JSON object")]
    NotAnObject,

    #[error("invalid JSON in request body: {0}")]
    Invalid(&'static str),

    #[error("`model` must be a string")]
    ModelNotAString,

    #[error("request body ended before the model field resolved")]
    Truncated,
}

/// Result of feeding more body bytes to the extractor.
#[derive(Debug, PartialEq, Eq)]
pub enum ScanStatus {
    /// The bytes seen so far do not resolve the model yet.
    NeedMore,
    /// Scanning is over. `None` means the field is absent or `null`; the
    /// caller maps both to the default pool.
    Resolved(Option<String>),
}

enum Step {
    Continue,
    Done(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    ExpectKeyOrEnd,
    ExpectKey,
    Key,
    KeyEscape,
    AfterKey,
    ValueStart,
    StrValue,
    StrValueEscape,
    Scalar,
    Nested,
    NestedString,
    NestedStringEscape,
    AfterValue,
}

/// Incremental scanner for the top-level `model` member of a JSON object.
///
/// Tracks just enough structure to walk depth-1 members and skip nested
/// containers. Captured strings are unescaped with `serde_json` once they
/// complete. Scalar lexemes other than the model value are skimmed, not
/// validated; the origin parses the full body anyway.
#[derive(Debug)]
pub struct ModelExtractor {
    state: State,
    depth: usize,
    key: Vec<u8>,
    key_is_model: bool,
    value: Vec<u8>,
    scalar_len: usize,
}

impl ModelExtractor {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            depth: 0,
            key: Vec::new(),
            key_is_model: false,
            value: Vec::new(),
            scalar_len: 0,
        }
    }

    /// Feed the next body chunk. Once this returns `Resolved` or an error,
    /// the extractor is spent.
    pub fn push(&mut self, chunk: &[u8]) -> Result<ScanStatus, PayloadError> {
        for &byte in chunk {
            if let Step::Done(model) = self.step(byte)? {
                return Ok(ScanStatus::Resolved(model));
            }
        }
        Ok(ScanStatus::NeedMore)
    }

    fn step(&mut self, byte: u8) -> Result<Step, PayloadError> {
        match self.state {
            State::Start => match byte {
                b if is_ws(b) => {}
                b'{' => self.state = State::ExpectKeyOrEnd,
                _ => return Err(PayloadError::NotAnObject),
            },

            State::ExpectKeyOrEnd => match byte {
                b if is_ws(b) => {}
                b'"' => {
                    self.key.clear();
                    self.state = State::Key;
                }
                b'}' => return Ok(Step::Done(None)),
                _ => return Err(PayloadError::Invalid("expected a key or '}'")),
            },

            State::ExpectKey => match byte {
                b if is_ws(b) => {}
                b'"' => {
                    self.key.clear();
                    self.state = State::Key;
                }
                _ => return Err(PayloadError::Invalid("expected a key")),
            },

            State::Key => match byte {
                b'\\' => {
                    self.key.push(byte);
                    self.state = State::KeyEscape;
                }
                b'"' => {
                    self.key_is_model = decode_string(&self.key)? == "model";
                    self.state = State::AfterKey;
                }
                _ => self.key.push(byte),
            },

            State::KeyEscape => {
                self.key.push(byte);
                self.state = State::Key;
            }

            State::AfterKey => match byte {
                b if is_ws(b) => {}
                b':' => self.state = State::ValueStart,
                _ => return Err(PayloadError::Invalid("expected ':' after key")),
            },

            State::ValueStart => match byte {
                b if is_ws(b) => {}
                b'"' => {
                    self.value.clear();
                    self.state = State::StrValue;
                }
                b'{' | b'[' => {
                    if self.key_is_model {
                        return Err(PayloadError::ModelNotAString);
                    }
                    self.depth = 1;
                    self.state = State::Nested;
                }
                b'n' => {
                    // Possibly `null`, which a string field tolerates.
                    self.scalar_len = 1;
                    self.state = State::Scalar;
                }
                b't' | b'f' | b'-' | b'0'..=b'9' => {
                    if self.key_is_model {
                        return Err(PayloadError::ModelNotAString);
                    }
                    self.state = State::Scalar;
                }
                _ => return Err(PayloadError::Invalid("unexpected value")),
            },

            State::StrValue => match byte {
                b'\\' => {
                    if self.key_is_model {
                        self.value.push(byte);
                    }
                    self.state = State::StrValueEscape;
                }
                b'"' => {
                    if self.key_is_model {
                        return Ok(Step::Done(Some(decode_string(&self.value)?)));
                    }
                    self.state = State::AfterValue;
                }
                _ => {
                    if self.key_is_model {
                        self.value.push(byte);
                    }
                }
            },

            State::StrValueEscape => {
                if self.key_is_model {
                    self.value.push(byte);
                }
                self.state = State::StrValue;
            }

            State::Scalar => match byte {
                b',' => {
                    if self.end_scalar()? {
                        return Ok(Step::Done(None));
                    }
                    self.state = State::ExpectKey;
                }
                b'}' => {
                    self.end_scalar()?;
                    return Ok(Step::Done(None));
                }
                b if is_ws(b) => {
                    if self.end_scalar()? {
                        return Ok(Step::Done(None));
                    }
                    self.state = State::AfterValue;
                }
                b'{' | b'[' | b']' | b'"' | b':' => {
                    return Err(PayloadError::Invalid("malformed scalar"))
                }
                b => {
                    if self.key_is_model {
                        const NULL: &[u8] = b"null";
                        if self.scalar_len >= NULL.len() || b != NULL[self.scalar_len] {
                            return Err(PayloadError::Invalid("model must be a string or null"));
                        }
                        self.scalar_len += 1;
                    }
                }
            },

            State::Nested => match byte {
                b'"' => self.state = State::NestedString,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.state = State::AfterValue;
                    }
                }
                _ => {}
            },

            State::NestedString => match byte {
                b'\\' => self.state = State::NestedStringEscape,
                b'"' => self.state = State::Nested,
                _ => {}
            },

            State::NestedStringEscape => self.state = State::NestedString,

            State::AfterValue => match byte {
                b if is_ws(b) => {}
                b',' => self.state = State::ExpectKey,
                b'}' => return Ok(Step::Done(None)),
                _ => return Err(PayloadError::Invalid("expected ',' or '}'")),
            },
        }

        Ok(Step::Continue)
    }

    /// Close out a scalar lexeme. Returns true when it was the model value
    /// (necessarily `null`), which resolves the scan.
    fn end_scalar(&mut self) -> Result<bool, PayloadError> {
        if !self.key_is_model {
            return Ok(false);
        }
        if self.scalar_len == 4 {
            Ok(true)
        } else {
            Err(PayloadError::Invalid("model must be a string or null"))
        }
    }
}

impl Default for ModelExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn is_ws(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r')
}

/// Decode a captured JSON string body (without the surrounding quotes).
fn decode_string(raw: &[u8]) -> Result<String, PayloadError> {
    if raw.contains(&b'\\') {
        let mut quoted = Vec::with_capacity(raw.len() + 2);
        quoted.push(b'"');
        quoted.extend_from_slice(raw);
        quoted.push(b'"');
        serde_json::from_slice(&quoted).map_err(|_| PayloadError::Invalid("bad string escape"))
    } else {
        String::from_utf8(raw.to_vec())
            .map_err(|_| PayloadError::Invalid("string is not valid utf-8"))
    }
}
