//! Typed wire reader/writer and the message model.
//!
//! The marshalling engine proper lives outside this subsystem; what the
//! peering core needs is a deterministic typed codec for the fixed
//! handshake and policy signatures. The signatures stay visible at the
//! boundary (`SIG_*` constants) for on-wire compatibility; the reader
//! and writer enforce them structurally.
//!
//! Encoding rules (little-endian, no alignment padding):
//! - `y` one byte, `q` two bytes, `u` four bytes
//! - `s` u32 length + UTF-8 bytes
//! - `ay` u32 length + raw bytes
//! - arrays: u32 byte-length of the content, then the content
//! - structs: fields concatenated, no framing

use crate::error::{BusError, Result};

// =============================================================================
// WIRE SIGNATURES
// =============================================================================

pub const SIG_EXCHANGE_GUIDS: &str = "su";
pub const SIG_EXCHANGE_SUITES: &str = "au";
pub const SIG_GEN_SESSION_KEY: &str = "sss";
pub const SIG_GEN_SESSION_KEY_REPLY: &str = "ss";
pub const SIG_EXCHANGE_GROUP_KEYS: &str = "ay";
pub const SIG_MANIFEST: &str = "a(ssa(syy))";
pub const SIG_POLICY: &str = "(qua(a(ya(yyayay)ay)a(ssa(syy))))";
pub const SIG_MEMBERSHIPS: &str = "ya(yay)";

// =============================================================================
// READ LIMITS
// =============================================================================
// A malformed length prefix must not drive an allocation. Strings cover
// object paths, interface names and hex nonces; byte arrays cover DER
// certificates and key material.

const MAX_STRING_LEN: usize = 512;
const MAX_BYTES_LEN: usize = 8 * 1024;
const MAX_ARRAY_BYTES: usize = 64 * 1024;

// =============================================================================
// WRITER
// =============================================================================

/// Deterministic wire writer. Identical input graphs produce identical
/// bytes across runs.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
    open: Vec<usize>,
}

impl WireWriter {
    pub fn new() -> WireWriter {
        WireWriter::default()
    }

    pub fn write_byte(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.write_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    /// Begin an array; the byte length is backpatched on close.
    pub fn open_array(&mut self) {
        self.open.push(self.buf.len());
        self.buf.extend_from_slice(&[0u8; 4]);
    }

    pub fn close_array(&mut self) {
        let at = self.open.pop().expect("close_array without open_array");
        let len = (self.buf.len() - at - 4) as u32;
        self.buf[at..at + 4].copy_from_slice(&len.to_le_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        debug_assert!(self.open.is_empty());
        self.buf
    }
}

// =============================================================================
// READER
// =============================================================================

/// Strict wire reader. Any overrun, bad length, or container mismatch
/// surfaces `Invalid`; callers roll back whatever they built.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    ends: Vec<usize>,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> WireReader<'a> {
        WireReader { buf, pos: 0, ends: Vec::new() }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.ends.last().copied().unwrap_or(self.buf.len());
        if self.pos + n > end {
            return Err(BusError::Invalid);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(BusError::Invalid);
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BusError::Invalid)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > MAX_BYTES_LEN {
            return Err(BusError::Invalid);
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn open_array(&mut self) -> Result<()> {
        let len = self.read_u32()? as usize;
        if len > MAX_ARRAY_BYTES {
            return Err(BusError::Invalid);
        }
        let end = self.pos + len;
        let outer = self.ends.last().copied().unwrap_or(self.buf.len());
        if end > outer {
            return Err(BusError::Invalid);
        }
        self.ends.push(end);
        Ok(())
    }

    /// True while the innermost open array has unread content.
    pub fn array_has_more(&self) -> bool {
        match self.ends.last() {
            Some(end) => self.pos < *end,
            None => false,
        }
    }

    pub fn close_array(&mut self) -> Result<()> {
        let end = self.ends.pop().ok_or(BusError::Invalid)?;
        if self.pos != end {
            return Err(BusError::Invalid);
        }
        Ok(())
    }

    /// Remaining unread length in the current scope.
    pub fn remaining(&self) -> usize {
        let end = self.ends.last().copied().unwrap_or(self.buf.len());
        end.saturating_sub(self.pos)
    }
}

// =============================================================================
// MESSAGE
// =============================================================================

/// Message-layer flag: the body is carried encrypted with the session
/// key. When set, the layer consults the access gate before the message
/// is emitted or accepted.
pub const FLAG_ENCRYPTED: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MsgType {
    fn as_byte(self) -> u8 {
        match self {
            MsgType::MethodCall => 1,
            MsgType::MethodReturn => 2,
            MsgType::Error => 3,
            MsgType::Signal => 4,
        }
    }
}

/// One bus message: header fields plus a marshalled body.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MsgType,
    /// Packed message id (list, object, interface, member).
    pub msg_id: u32,
    pub serial: u32,
    pub reply_serial: u32,
    pub flags: u8,
    /// Bus-local unique name of the sending endpoint; stamped by the
    /// delivering transport, authoritative for reply binding.
    pub sender: String,
    pub destination: String,
    /// Error name, for `MsgType::Error` only.
    pub error: Option<String>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn method_call(msg_id: u32, destination: &str, flags: u8, serial: u32) -> Message {
        Message {
            msg_type: MsgType::MethodCall,
            msg_id,
            serial,
            reply_serial: 0,
            flags,
            sender: String::new(),
            destination: destination.to_string(),
            error: None,
            body: Vec::new(),
        }
    }

    pub fn method_return(call: &Message, serial: u32) -> Message {
        Message {
            msg_type: MsgType::MethodReturn,
            msg_id: crate::introspect::reply_id(call.msg_id),
            serial,
            reply_serial: call.serial,
            flags: call.flags,
            sender: String::new(),
            destination: call.sender.clone(),
            error: None,
            body: Vec::new(),
        }
    }

    pub fn error_reply(call: &Message, serial: u32, name: &str) -> Message {
        Message {
            msg_type: MsgType::Error,
            msg_id: crate::introspect::reply_id(call.msg_id),
            serial,
            reply_serial: call.serial,
            flags: call.flags,
            sender: String::new(),
            destination: call.sender.clone(),
            error: Some(name.to_string()),
            body: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.msg_type == MsgType::Error
    }

    pub fn error_status(&self) -> BusError {
        match &self.error {
            Some(name) => BusError::from_wire_name(name),
            None => BusError::Security,
        }
    }

    pub fn reader(&self) -> WireReader<'_> {
        WireReader::new(&self.body)
    }

    /// Canonical bytes fed to the conversation hash: the header tuple
    /// followed by the body. Transport framing and routing names are
    /// excluded so both ends hash identical content.
    pub fn hash_input(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14 + self.body.len());
        out.push(self.msg_type.as_byte());
        out.push(self.flags);
        out.extend_from_slice(&self.msg_id.to_le_bytes());
        out.extend_from_slice(&self.serial.to_le_bytes());
        out.extend_from_slice(&self.reply_serial.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}
