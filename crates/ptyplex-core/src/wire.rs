//! Framing for the per-session streaming connection.
//!
//! Every message is `[1-byte opcode][payload]`. Payloads are text-safe: the
//! server only ever emits UTF-8, and clients send UTF-8 as well.
//!
//! | Direction | Opcode | Payload |
//! |-----------|--------|---------|
//! | client → server | `a` | shared secret |
//! | client → server | `p` / `r` | none (pause / resume output) |
//! | client → server | `w` | raw input bytes |
//! | client → server | `s` | `"<rows>x<cols>"` |
//! | client → server | `c` | none (close the session) |
//! | server → client | `a` | none (auth accepted) |
//! | server → client | `d` | terminal output |
//! | server → client | `e` | none (session ended, terminal) |
//! | server → client | `k` | none (keepalive) |

pub const OP_AUTH: u8 = b'a';
pub const OP_PAUSE: u8 = b'p';
pub const OP_RESUME: u8 = b'r';
pub const OP_WRITE: u8 = b'w';
pub const OP_RESIZE: u8 = b's';
pub const OP_CLOSE: u8 = b'c';
pub const OP_DATA: u8 = b'd';
pub const OP_EXIT: u8 = b'e';
pub const OP_KEEPALIVE: u8 = b'k';

/// Terminal dimensions as carried by a resize message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    /// Parse a `"<rows>x<cols>"` payload.
    ///
    /// Returns `None` for anything that is not two non-zero `u16` values,
    /// e.g. `"x80"`, `"24x"`, `"0x80"` or `"24x80x1"`.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        let (rows, cols) = text.trim().split_once('x')?;
        let rows: u16 = rows.parse().ok()?;
        let cols: u16 = cols.parse().ok()?;
        if rows == 0 || cols == 0 {
            return None;
        }
        Some(Self { rows, cols })
    }
}

/// A decoded client → server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame<'a> {
    Auth(&'a str),
    Pause,
    Resume,
    Write(&'a [u8]),
    /// `None` when the payload was malformed; the caller drops it.
    Resize(Option<WindowSize>),
    Close,
    Unknown(u8),
}

impl<'a> ClientFrame<'a> {
    /// Decode one message. Returns `None` only for an empty message.
    pub fn parse(message: &'a [u8]) -> Option<Self> {
        let (&opcode, payload) = message.split_first()?;
        let frame = match opcode {
            // A token that is not UTF-8 can never match; an empty string
            // keeps the auth check uniform.
            OP_AUTH => ClientFrame::Auth(std::str::from_utf8(payload).unwrap_or("")),
            OP_PAUSE => ClientFrame::Pause,
            OP_RESUME => ClientFrame::Resume,
            OP_WRITE => ClientFrame::Write(payload),
            OP_RESIZE => ClientFrame::Resize(WindowSize::parse(payload)),
            OP_CLOSE => ClientFrame::Close,
            other => ClientFrame::Unknown(other),
        };
        Some(frame)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ClientFrame::Auth(_))
    }
}

/// A server → client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    AuthAck,
    Data(String),
    Exit,
    Keepalive,
}

impl ServerFrame {
    pub fn opcode(&self) -> u8 {
        match self {
            ServerFrame::AuthAck => OP_AUTH,
            ServerFrame::Data(_) => OP_DATA,
            ServerFrame::Exit => OP_EXIT,
            ServerFrame::Keepalive => OP_KEEPALIVE,
        }
    }

    /// Encode as the text message sent on the wire.
    pub fn encode(&self) -> String {
        let opcode = char::from(self.opcode());
        match self {
            ServerFrame::Data(text) => {
                let mut out = String::with_capacity(text.len() + 1);
                out.push(opcode);
                out.push_str(text);
                out
            }
            _ => opcode.to_string(),
        }
    }

    /// Decode a server message (used by clients and tests).
    pub fn parse(message: &str) -> Option<Self> {
        let mut chars = message.chars();
        let opcode = chars.next()?;
        let rest = chars.as_str();
        match u8::try_from(opcode).ok()? {
            OP_AUTH => Some(ServerFrame::AuthAck),
            OP_DATA => Some(ServerFrame::Data(rest.to_string())),
            OP_EXIT => Some(ServerFrame::Exit),
            OP_KEEPALIVE => Some(ServerFrame::Keepalive),
            _ => None,
        }
    }
}

/// Incremental UTF-8 decoder for terminal output.
///
/// PTY reads split the byte stream at arbitrary points, so a multi-byte
/// character can straddle two chunks. The incomplete tail is held back until
/// the next chunk arrives. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `chunk` (plus any held-back bytes) as possible.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut consumed = 0;

        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&rest[..valid_up_to]) {
                        out.push_str(valid);
                    }
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid_up_to + bad;
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more.
                            consumed += valid_up_to;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }

    /// Flush held-back bytes, replacing an unfinished sequence with U+FFFD.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
