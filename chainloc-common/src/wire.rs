//! # Lookup Wire Protocol
//!
//! Purpose: Encode `get`/`set` requests and parse the marker-delimited text
//! responses of the chain-replicated lookup service, tolerating message
//! boundaries split across TCP reads.
//!
//! ## Design Principles
//! 1. **Named Widths**: Every field width and marker is a named constant;
//!    protocol revisions touch this module only.
//! 2. **Never Drop Bytes**: A partially received response stays in the
//!    decoder's fragment and is completed by the next read.
//! 3. **Fail Fast on Desync**: A marker in the wrong place means the stream
//!    can no longer be trusted to line up with keys; the caller must tear the
//!    connection down rather than guess.
//! 4. **Buffer Reuse**: One `BytesMut` fragment per decoder, advanced in
//!    place.

use bytes::{Buf, BytesMut};

use crate::error::{ChainlocError, ChainlocResult};
use crate::types::{DataKey, Entry, KEY_WIDTH};

/// Byte appended to every key on the wire.
pub const KEY_TERMINATOR: u8 = b'Z';

/// Width of a key as transmitted: the key bytes plus the terminator.
pub const WIRE_KEY_WIDTH: usize = KEY_WIDTH + 1;

/// Request prefixes and line terminator.
pub const GET_PREFIX: &[u8] = b"get ";
pub const SET_PREFIX: &[u8] = b"set ";
pub const LINE_END: &[u8] = b"\r\n";

/// Width of a serialized entry: the server ID as zero-padded decimal.
pub const ENTRY_WIDTH: usize = 10;

/// Width of the decimal size field in SET requests and VALUE responses.
pub const SIZE_FIELD_WIDTH: usize = 2;

/// Two-byte marker closing the data block of a SET request.
pub const SET_DATA_SUFFIX: &[u8] = b"ND";

/// Declared size of a SET data block: the entry plus its suffix.
pub const SET_DATA_SIZE: usize = ENTRY_WIDTH + SET_DATA_SUFFIX.len();

/// Response markers. A response begins at a marker and runs to the next
/// marker of any type or to the end-of-batch sequence.
pub const VALUE_MARKER: &[u8] = b"VALUE";
pub const STORED_MARKER: &[u8] = b"STORED";
pub const NOT_FOUND_MARKER: &[u8] = b"NOT_FOUND";
pub const ERROR_MARKER: &[u8] = b"ERROR";

/// Two-byte suffix closing the entry bytes of a VALUE response.
pub const VALUE_SUFFIX: &[u8] = b"YY";

/// Sequence terminating the final response of a batch.
pub const END_OF_BATCH: &[u8] = b"YZ";

/// Encodes a GET request for `key`.
pub fn encode_get(key: &DataKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(GET_PREFIX.len() + WIRE_KEY_WIDTH + LINE_END.len());
    out.extend_from_slice(GET_PREFIX);
    out.extend_from_slice(key.as_bytes());
    out.push(KEY_TERMINATOR);
    out.extend_from_slice(LINE_END);
    out
}

/// Encodes a SET request writing `entry` under `key`.
pub fn encode_set(key: &DataKey, entry: &Entry) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        SET_PREFIX.len() + WIRE_KEY_WIDTH + 1 + SIZE_FIELD_WIDTH + 2 * LINE_END.len() + SET_DATA_SIZE,
    );
    out.extend_from_slice(SET_PREFIX);
    out.extend_from_slice(key.as_bytes());
    out.push(KEY_TERMINATOR);
    out.push(b' ');
    push_padded(&mut out, SET_DATA_SIZE as u64, SIZE_FIELD_WIDTH);
    out.extend_from_slice(LINE_END);
    push_padded(&mut out, u64::from(entry.server_id()), ENTRY_WIDTH);
    out.extend_from_slice(SET_DATA_SUFFIX);
    out.extend_from_slice(LINE_END);
    out
}

// Zero-padded decimal via a stack buffer, sized to the wire's fixed widths.
fn push_padded(out: &mut Vec<u8>, mut value: u64, width: usize) {
    let mut digits = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        digits[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            digits[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for _ in len..width {
        out.push(b'0');
    }
    for idx in (0..len).rev() {
        out.push(digits[idx]);
    }
}

/// One fully parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawResponse {
    Stored { key: DataKey },
    Value { key: DataKey, entry: Entry },
    NotFound { key: DataKey },
    Error { raw: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Value,
    Stored,
    NotFound,
    Error,
}

impl Marker {
    const ALL: [Marker; 4] = [Marker::Value, Marker::Stored, Marker::NotFound, Marker::Error];

    fn text(self) -> &'static [u8] {
        match self {
            Marker::Value => VALUE_MARKER,
            Marker::Stored => STORED_MARKER,
            Marker::NotFound => NOT_FOUND_MARKER,
            Marker::Error => ERROR_MARKER,
        }
    }
}

fn find_subslice(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|window| window == needle)
}

// The structurally smallest offset wins regardless of marker type.
fn find_earliest_marker(hay: &[u8]) -> Option<(Marker, usize)> {
    let mut best: Option<(Marker, usize)> = None;
    for marker in Marker::ALL {
        if let Some(at) = find_subslice(hay, marker.text()) {
            if best.map_or(true, |(_, prev)| at < prev) {
                best = Some((marker, at));
            }
        }
    }
    best
}

// Absolute end offset of the phrase whose header ends at `from`: the next
// marker of any type, or just past the end-of-batch sequence, whichever
// comes first. `None` means the phrase runs to the end of the buffer.
fn phrase_end(buf: &[u8], from: usize) -> Option<usize> {
    let tail = &buf[from..];
    let mut best = find_earliest_marker(tail).map(|(_, at)| from + at);
    if let Some(at) = find_subslice(tail, END_OF_BATCH) {
        let end = from + at + END_OF_BATCH.len();
        if best.map_or(true, |prev| end < prev) {
            best = Some(end);
        }
    }
    best
}

fn parse_wire_key(phrase: &[u8], header: usize) -> ChainlocResult<DataKey> {
    let wire_key = &phrase[header..header + WIRE_KEY_WIDTH];
    if wire_key[KEY_WIDTH] != KEY_TERMINATOR {
        return Err(ChainlocError::Desync("missing key terminator"));
    }
    DataKey::new(&wire_key[..KEY_WIDTH]).map_err(|_| ChainlocError::Desync("bad key width"))
}

fn parse_server_id(digits: &[u8]) -> ChainlocResult<u32> {
    let mut value: u64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ChainlocError::Desync("non-digit in entry field"));
        }
        value = value * 10 + u64::from(b - b'0');
    }
    u32::try_from(value).map_err(|_| ChainlocError::EntryRange(value))
}

/// Streaming response parser with fragment carry-over.
///
/// Feed it every chunk read from the socket; it returns the responses that
/// are complete and keeps whatever is left for the next read. A `Desync`
/// error means the connection must be killed: silent misalignment would
/// corrupt future key matching.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    fragment: BytesMut,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        ResponseDecoder {
            fragment: BytesMut::new(),
        }
    }

    /// Discards the buffered fragment. Call when a new socket is installed;
    /// leftover bytes belong to the previous socket's stream.
    pub fn reset(&mut self) {
        self.fragment.clear();
    }

    /// Bytes currently buffered waiting for the rest of a response.
    pub fn fragment_len(&self) -> usize {
        self.fragment.len()
    }

    /// Appends `chunk` to the fragment and extracts every complete response.
    pub fn feed(&mut self, chunk: &[u8]) -> ChainlocResult<Vec<RawResponse>> {
        self.fragment.extend_from_slice(chunk);
        let mut responses = Vec::new();
        let mut pos = 0usize;

        loop {
            // Skip line terminators between phrases and the stray terminator
            // byte a batch-end sequence leaves behind.
            while pos < self.fragment.len() {
                match self.fragment[pos] {
                    b'\r' | b'\n' | KEY_TERMINATOR => pos += 1,
                    _ => break,
                }
            }
            let tail = &self.fragment[pos..];
            if tail.is_empty() {
                break;
            }

            let Some((marker, at)) = find_earliest_marker(tail) else {
                // Possibly a partial marker; keep the tail for the next read.
                break;
            };
            if at != 0 {
                return Err(ChainlocError::Desync("marker at non-zero offset"));
            }

            let header = marker.text().len();
            let end = phrase_end(&self.fragment, pos + header);
            let phrase_len = end.map_or(tail.len(), |e| e - pos);
            let phrase = &tail[..phrase_len];

            match marker {
                Marker::Error => {
                    // The protocol does not say how long an ERROR body is; it
                    // runs to the cut, or swallows the tail when last.
                    responses.push(RawResponse::Error {
                        raw: phrase.to_vec(),
                    });
                    pos += phrase_len;
                }
                Marker::Stored | Marker::NotFound => {
                    let need = header + WIRE_KEY_WIDTH;
                    if phrase.len() < need {
                        if end.is_some() {
                            return Err(ChainlocError::Desync("truncated response body"));
                        }
                        break;
                    }
                    let key = parse_wire_key(phrase, header)?;
                    responses.push(match marker {
                        Marker::Stored => RawResponse::Stored { key },
                        _ => RawResponse::NotFound { key },
                    });
                    pos += end.map_or(need, |e| e - pos);
                }
                Marker::Value => {
                    let need =
                        header + WIRE_KEY_WIDTH + SIZE_FIELD_WIDTH + ENTRY_WIDTH + VALUE_SUFFIX.len();
                    if phrase.len() < need {
                        if end.is_some() {
                            return Err(ChainlocError::Desync("truncated response body"));
                        }
                        break;
                    }
                    let key = parse_wire_key(phrase, header)?;
                    let size_at = header + WIRE_KEY_WIDTH;
                    if !phrase[size_at..size_at + SIZE_FIELD_WIDTH]
                        .iter()
                        .all(u8::is_ascii_digit)
                    {
                        return Err(ChainlocError::Desync("non-digit in size field"));
                    }
                    let entry_at = size_at + SIZE_FIELD_WIDTH;
                    let server_id = parse_server_id(&phrase[entry_at..entry_at + ENTRY_WIDTH])?;
                    let suffix_at = entry_at + ENTRY_WIDTH;
                    if &phrase[suffix_at..suffix_at + VALUE_SUFFIX.len()] != VALUE_SUFFIX {
                        return Err(ChainlocError::Desync("bad value suffix"));
                    }
                    responses.push(RawResponse::Value {
                        key,
                        entry: Entry::new(server_id),
                    });
                    pos += end.map_or(need, |e| e - pos);
                }
            }
        }

        self.fragment.advance(pos);
        Ok(responses)
    }
}
