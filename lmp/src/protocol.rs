// SPDX-License-Identifier: BlueOak-1.0.0

//! Request kinds, wire layout and status codes for the LMP protocol:
//! a closed, numerically-tagged request enum and the message builders
//! and decoders for each one.

use crate::error::{LResult, LmpError};
use alloc::string::String;
use kcap::{Cap, LmpMessage, RamCap, LMP_MSG_WORDS};

/// The closed set of LMP request kinds. The numeric tag is part of the
/// wire format, not just a label — variant order must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum RequestKind {
    /// Not a real request; `0` is reserved so a zeroed message is
    /// never mistaken for a legitimate one.
    Null = 0,
    /// Carries one machine word of application data.
    Number,
    /// A string or small buffer copied inline into message words.
    ShortBuf,
    /// A buffer too large for `ShortBuf`, carried as a frame capability.
    FrameSend,
    /// Registers the sender's endpoint as the server's reply channel.
    Register,
    /// `MemoryAlloc(bytes, align)`.
    MemoryAlloc,
    /// `MemoryFree(bytes, cap)`.
    MemoryFree,
    /// `Spawn(core_id, name)`.
    Spawn,
    /// Look up a process by PID.
    NameLookup,
    /// Discover live PIDs.
    PidDiscover,
    /// Read one character from the serial driver.
    TerminalGetChar,
    /// Write one character to the serial driver.
    TerminalPutChar,
    /// Echoes the request back, for liveness testing.
    Echo,
    /// Negotiates a UMP channel binding.
    UmpBind,
    /// Requests a device capability.
    GetDeviceCap,
}

impl RequestKind {
    /// Decode `tag` (normally `words[0]`) into a `RequestKind`.
    pub fn from_tag(tag: usize) -> LResult<RequestKind> {
        Ok(match tag {
            0 => RequestKind::Null,
            1 => RequestKind::Number,
            2 => RequestKind::ShortBuf,
            3 => RequestKind::FrameSend,
            4 => RequestKind::Register,
            5 => RequestKind::MemoryAlloc,
            6 => RequestKind::MemoryFree,
            7 => RequestKind::Spawn,
            8 => RequestKind::NameLookup,
            9 => RequestKind::PidDiscover,
            10 => RequestKind::TerminalGetChar,
            11 => RequestKind::TerminalPutChar,
            12 => RequestKind::Echo,
            13 => RequestKind::UmpBind,
            14 => RequestKind::GetDeviceCap,
            _ => return Err(LmpError::UnknownRequest { tag }),
        })
    }
}

/// Protocol-level outcome carried as a reply word, distinct from a
/// transport-level [`crate::error::LmpError`]: protocol-level errors
/// travel as a status word in the reply, not as a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Status {
    /// The request was serviced successfully.
    Ok = 0,
    /// A size or alignment argument was zero, or a size exceeded an
    /// installation-defined ceiling.
    InvalidSize = 1,
    /// The registered handler for this request failed.
    HandlerFailed = 2,
    /// A spawn request's name exceeded the packed-word name budget.
    NameTooLong = 3,
    /// No handler is registered for this request kind.
    Unhandled = 4,
}

impl Status {
    fn from_word(word: usize) -> Status {
        match word {
            0 => Status::Ok,
            1 => Status::InvalidSize,
            2 => Status::HandlerFailed,
            3 => Status::NameTooLong,
            _ => Status::Unhandled,
        }
    }
}

/// An installation-defined ceiling on one `MemoryAlloc` request.
pub const MEMORY_ALLOC_CEILING: usize = 100_000_000;

/// Words available for a `ShortBuf`/`Spawn` payload after the tag and
/// one or two header words are subtracted from [`LMP_MSG_WORDS`].
const SHORT_BUF_HEADER_WORDS: usize = 2; // tag, length
/// Bytes a `ShortBuf` message can carry inline.
pub const SHORT_BUF_BYTES: usize = (LMP_MSG_WORDS - SHORT_BUF_HEADER_WORDS) * core::mem::size_of::<usize>();

const SPAWN_HEADER_WORDS: usize = 2; // tag, core_id
/// Bytes available to a spawn request's process name, NUL-terminated
/// and packed across the remaining message words.
pub const SPAWN_NAME_BYTES: usize = (LMP_MSG_WORDS - SPAWN_HEADER_WORDS) * core::mem::size_of::<usize>();

fn words_to_bytes(words: &[usize]) -> alloc::vec::Vec<u8> {
    let mut out = alloc::vec::Vec::with_capacity(words.len() * core::mem::size_of::<usize>());
    for w in words {
        out.extend_from_slice(&w.to_ne_bytes());
    }
    out
}

fn bytes_to_words(bytes: &[u8], out: &mut [usize]) {
    for (word, chunk) in out.iter_mut().zip(bytes.chunks(core::mem::size_of::<usize>())) {
        let mut buf = [0u8; core::mem::size_of::<usize>()];
        buf[..chunk.len()].copy_from_slice(chunk);
        *word = usize::from_ne_bytes(buf);
    }
}

/// Build a `Register` request carrying the client's reply endpoint
/// capability.
pub fn register_request(client_endpoint: Cap) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::Register as usize;
    LmpMessage::with_cap(words, client_endpoint)
}

/// Build a `Register` reply.
pub fn register_reply(status: Status) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::Register as usize;
    words[1] = status as usize;
    LmpMessage::words(words)
}

/// Decode a `Register` reply's status.
pub fn decode_register_reply(msg: &LmpMessage) -> Status {
    Status::from_word(msg.words[1])
}

/// Build a `MemoryAlloc(bytes, align)` request.
pub fn memory_alloc_request(bytes: usize, align: usize) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::MemoryAlloc as usize;
    words[1] = bytes;
    words[2] = align;
    LmpMessage::words(words)
}

/// Decode a `MemoryAlloc` request's `(bytes, align)`.
pub fn decode_memory_alloc_request(msg: &LmpMessage) -> (usize, usize) {
    (msg.words[1], msg.words[2])
}

/// Build a `MemoryAlloc` reply. `ram` is [`None`] unless `status` is
/// [`Status::Ok`].
pub fn memory_alloc_reply(status: Status, ram: Option<RamCap>) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::MemoryAlloc as usize;
    words[1] = status as usize;
    let cap = ram.map(|r| r.cap).unwrap_or(Cap::NULL);
    words[2] = ram.map(|r| r.bytes).unwrap_or(0);
    LmpMessage::with_cap(words, cap)
}

/// Decode a `MemoryAlloc` reply into `(status, ram)`.
pub fn decode_memory_alloc_reply(msg: &LmpMessage) -> (Status, Option<RamCap>) {
    let status = Status::from_word(msg.words[1]);
    let ram = if status == Status::Ok {
        Some(RamCap { cap: msg.cap, bytes: msg.words[2] })
    } else {
        None
    };
    (status, ram)
}

/// Build a `MemoryFree(bytes, cap)` request.
pub fn memory_free_request(ram: RamCap) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::MemoryFree as usize;
    words[1] = ram.bytes;
    LmpMessage::with_cap(words, ram.cap)
}

/// Decode a `MemoryFree` request into the `RamCap` it names.
pub fn decode_memory_free_request(msg: &LmpMessage) -> RamCap {
    RamCap { cap: msg.cap, bytes: msg.words[1] }
}

/// Build a `MemoryFree` reply.
pub fn memory_free_reply(status: Status) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::MemoryFree as usize;
    words[1] = status as usize;
    LmpMessage::words(words)
}

/// Decode a `MemoryFree` reply's status.
pub fn decode_memory_free_reply(msg: &LmpMessage) -> Status {
    Status::from_word(msg.words[1])
}

/// Build a `Spawn(core_id, name)` request, packing `name` as a
/// NUL-terminated byte string across the remaining argument words.
pub fn spawn_request(core_id: u32, name: &str) -> LResult<LmpMessage> {
    if name.len() >= SPAWN_NAME_BYTES {
        return Err(LmpError::NameTooLong { len: name.len(), max: SPAWN_NAME_BYTES - 1 });
    }
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::Spawn as usize;
    words[1] = core_id as usize;

    let mut buf = [0u8; SPAWN_NAME_BYTES];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    bytes_to_words(&buf, &mut words[SPAWN_HEADER_WORDS..]);

    Ok(LmpMessage::words(words))
}

/// Decode a `Spawn` request's `(core_id, name)`.
pub fn decode_spawn_request(msg: &LmpMessage) -> (u32, String) {
    let core_id = msg.words[1] as u32;
    let bytes = words_to_bytes(&msg.words[SPAWN_HEADER_WORDS..]);
    let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let name = String::from_utf8_lossy(&bytes[..nul]).into_owned();
    (core_id, name)
}

/// Build a `Spawn` reply carrying the new process's PID.
pub fn spawn_reply(status: Status, pid: u32) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::Spawn as usize;
    words[1] = status as usize;
    words[2] = pid as usize;
    LmpMessage::words(words)
}

/// Decode a `Spawn` reply into `(status, pid)`.
pub fn decode_spawn_reply(msg: &LmpMessage) -> (Status, u32) {
    (Status::from_word(msg.words[1]), msg.words[2] as u32)
}

/// Build a `TerminalPutChar(ch)` request.
pub fn terminal_put_char_request(ch: u8) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::TerminalPutChar as usize;
    words[1] = ch as usize;
    LmpMessage::words(words)
}

/// Decode a `TerminalPutChar` request's character.
pub fn decode_terminal_put_char_request(msg: &LmpMessage) -> u8 {
    msg.words[1] as u8
}

/// Build a `TerminalPutChar` reply.
pub fn terminal_put_char_reply(status: Status) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::TerminalPutChar as usize;
    words[1] = status as usize;
    LmpMessage::words(words)
}

/// Decode a `TerminalPutChar` reply's status.
pub fn decode_terminal_put_char_reply(msg: &LmpMessage) -> Status {
    Status::from_word(msg.words[1])
}

/// Build a `TerminalGetChar` request.
pub fn terminal_get_char_request() -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::TerminalGetChar as usize;
    LmpMessage::words(words)
}

/// Build a `TerminalGetChar` reply.
pub fn terminal_get_char_reply(status: Status, ch: u8) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::TerminalGetChar as usize;
    words[1] = status as usize;
    words[2] = ch as usize;
    LmpMessage::words(words)
}

/// Decode a `TerminalGetChar` reply into `(status, ch)`.
pub fn decode_terminal_get_char_reply(msg: &LmpMessage) -> (Status, u8) {
    (Status::from_word(msg.words[1]), msg.words[2] as u8)
}

/// Build a `ShortBuf` request carrying `payload` inline.
///
/// # Panics
/// Panics if `payload.len() > SHORT_BUF_BYTES`; callers are expected
/// to have already chosen `ShortBuf` over `FrameSend` via
/// [`fits_short_buf`].
pub fn short_buf_request(payload: &[u8]) -> LmpMessage {
    assert!(payload.len() <= SHORT_BUF_BYTES, "payload does not fit a ShortBuf message");
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::ShortBuf as usize;
    words[1] = payload.len();
    let mut buf = [0u8; SHORT_BUF_BYTES];
    buf[..payload.len()].copy_from_slice(payload);
    bytes_to_words(&buf, &mut words[SHORT_BUF_HEADER_WORDS..]);
    LmpMessage::words(words)
}

/// Decode a `ShortBuf` request's inline payload.
pub fn decode_short_buf_request(msg: &LmpMessage) -> alloc::vec::Vec<u8> {
    let len = msg.words[1].min(SHORT_BUF_BYTES);
    let mut bytes = words_to_bytes(&msg.words[SHORT_BUF_HEADER_WORDS..]);
    bytes.truncate(len);
    bytes
}

/// Build a `FrameSend(size)` request; `frame` must already hold
/// `size` bytes of payload (writing the frame's contents is
/// `selfpaging`'s job, not this crate's).
pub fn frame_send_request(frame: Cap, size: usize) -> LmpMessage {
    let mut words = [0usize; LMP_MSG_WORDS];
    words[0] = RequestKind::FrameSend as usize;
    words[1] = size;
    LmpMessage::with_cap(words, frame)
}

/// Whether `len` bytes fit inline in a `ShortBuf` message, i.e.
/// whether automatic transport selection picks `ShortBuf` over
/// `FrameSend`.
pub fn fits_short_buf(len: usize) -> bool {
    len <= SHORT_BUF_BYTES
}
