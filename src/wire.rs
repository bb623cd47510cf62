//! Wire encoding of protocol messages.
//!
//! A message is a header followed by zero or one opcode-specific body. All
//! integers are fixed-width big-endian; arrays and raw byte fields are
//! varint-length-prefixed. Each encoded message travels inside a frame of
//! `varint(len) | crc32(payload) | payload` so a stream of frames can be
//! reassembled from arbitrarily chunked transport reads.
//!
//! Decoding never touches engine state: a message either decodes completely
//! into an owned [`Message`] or is rejected with a [`WireError`].

use std::fmt;

use crc32fast::Hasher;

use crate::data::{DataMut, DataReader, ReadError};
use crate::ids::{Ballot, Paxid, ReqId, SessionId};

/// Upper bound on a single frame. A welcome carrying a long session history
/// is the only large message; anything beyond this is a corrupt length.
pub const MAX_FRAME: usize = 4 * 1024 * 1024;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum WireError {
    Read(ReadError),
    BadOpcode(u8),
    BadDkind(u8),
    BadLength,
    BadChecksum,
    Oversize,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::Read(e) => write!(f, "Read({})", e),
            WireError::BadOpcode(op) => write!(f, "BadOpcode({})", op),
            WireError::BadDkind(k) => write!(f, "BadDkind({})", k),
            WireError::BadLength => write!(f, "BadLength"),
            WireError::BadChecksum => write!(f, "BadChecksum"),
            WireError::Oversize => write!(f, "Oversize"),
        }
    }
}

impl From<ReadError> for WireError {
    fn from(e: ReadError) -> WireError {
        WireError::Read(e)
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum Opcode {
    Prepare,
    Promise,
    Decree,
    Accept,
    Commit,
    Request,
    Redirect,
    Welcome,
    Hello,
    Retrieve,
    Resend,
}

impl Opcode {
    pub fn to_u8(self) -> u8 {
        match self {
            Opcode::Prepare => 0,
            Opcode::Promise => 1,
            Opcode::Decree => 2,
            Opcode::Accept => 3,
            Opcode::Commit => 4,
            Opcode::Request => 5,
            Opcode::Redirect => 6,
            Opcode::Welcome => 7,
            Opcode::Hello => 8,
            Opcode::Retrieve => 9,
            Opcode::Resend => 10,
        }
    }

    pub fn from_u8(op: u8) -> Option<Opcode> {
        match op {
            0 => Some(Opcode::Prepare),
            1 => Some(Opcode::Promise),
            2 => Some(Opcode::Decree),
            3 => Some(Opcode::Accept),
            4 => Some(Opcode::Commit),
            5 => Some(Opcode::Request),
            6 => Some(Opcode::Redirect),
            7 => Some(Opcode::Welcome),
            8 => Some(Opcode::Hello),
            9 => Some(Opcode::Retrieve),
            10 => Some(Opcode::Resend),

            _ => None,
        }
    }
}

/// The kind of decree a value carries.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Dkind {
    /// No-op decreed to plug a log hole during repair
    Null,
    Chat,
    Join,
    Part,
}

impl Dkind {
    pub fn to_u8(self) -> u8 {
        match self {
            Dkind::Null => 0,
            Dkind::Chat => 1,
            Dkind::Join => 2,
            Dkind::Part => 3,
        }
    }

    pub fn from_u8(k: u8) -> Option<Dkind> {
        match k {
            0 => Some(Dkind::Null),
            1 => Some(Dkind::Chat),
            2 => Some(Dkind::Join),
            3 => Some(Dkind::Part),
            _ => None,
        }
    }
}

/// Common message header. For WELCOME and HELLO the inum field is overloaded
/// to carry a paxid (the new member's assignment, or the sender's identity).
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Header {
    pub session: SessionId,
    pub ballot: Ballot,
    pub op: Opcode,
    pub inum: Paxid,
}

impl Header {
    pub fn pack(&self, w: &mut DataMut) {
        w.put_u64_be(self.session.0);
        w.put_u32_be(self.ballot.id);
        w.put_u32_be(self.ballot.gen);
        w.put_u8(self.op.to_u8());
        w.put_u32_be(self.inum);
    }

    pub fn unpack(r: &mut DataReader) -> Result<Header, WireError> {
        let session = SessionId(r.get_u64_be()?);
        let id = r.get_u32_be()?;
        let gen = r.get_u32_be()?;
        let op = r.get_u8()?;
        let inum = r.get_u32_be()?;
        let op = Opcode::from_u8(op).ok_or(WireError::BadOpcode(op))?;
        Ok(Header {
            session,
            ballot: Ballot::new(id, gen),
            op,
            inum,
        })
    }
}

/// Payload of a decree. The raw client bytes are kept out of the value to
/// keep log traffic light; they live in the request cache keyed by reqid.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Value {
    pub dkind: Dkind,
    pub reqid: ReqId,
    /// Extra paxid whose meaning depends on dkind (the departing member for
    /// PART, unused otherwise)
    pub extra: Paxid,
}

impl Value {
    pub fn pack(&self, w: &mut DataMut) {
        w.put_u8(self.dkind.to_u8());
        w.put_u32_be(self.reqid.id);
        w.put_u32_be(self.reqid.gen);
        w.put_u32_be(self.extra);
    }

    pub fn unpack(r: &mut DataReader) -> Result<Value, WireError> {
        let k = r.get_u8()?;
        let dkind = Dkind::from_u8(k).ok_or(WireError::BadDkind(k))?;
        let id = r.get_u32_be()?;
        let gen = r.get_u32_be()?;
        let extra = r.get_u32_be()?;
        Ok(Value {
            dkind,
            reqid: ReqId::new(id, gen),
            extra,
        })
    }
}

/// A log instance as reported in PROMISE replies and WELCOME transfers.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct InstanceRec {
    pub hdr: Header,
    pub committed: bool,
    pub value: Value,
}

impl InstanceRec {
    pub fn pack(&self, w: &mut DataMut) {
        self.hdr.pack(w);
        w.put_bool(self.committed);
        self.value.pack(w);
    }

    pub fn unpack(r: &mut DataReader) -> Result<InstanceRec, WireError> {
        let hdr = Header::unpack(r)?;
        let committed = r.get_bool()?;
        let value = Value::unpack(r)?;
        Ok(InstanceRec { hdr, committed, value })
    }
}

/// A membership entry as transferred in WELCOME messages.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct AcceptorRec {
    pub paxid: Paxid,
    pub desc: Vec<u8>,
}

impl AcceptorRec {
    pub fn pack(&self, w: &mut DataMut) {
        w.put_u32_be(self.paxid);
        w.put_varint_prefixed_slice(&self.desc);
    }

    pub fn unpack(r: &mut DataReader) -> Result<AcceptorRec, WireError> {
        let paxid = r.get_u32_be()?;
        let desc = r.get_varint_prefixed_slice()?.to_vec();
        Ok(AcceptorRec { paxid, desc })
    }
}

/// A client request: its value plus the raw payload bytes.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct RequestRec {
    pub value: Value,
    pub data: Vec<u8>,
}

impl RequestRec {
    pub fn pack(&self, w: &mut DataMut) {
        self.value.pack(w);
        w.put_varint_prefixed_slice(&self.data);
    }

    pub fn unpack(r: &mut DataReader) -> Result<RequestRec, WireError> {
        let value = Value::unpack(r)?;
        let data = r.get_varint_prefixed_slice()?.to_vec();
        Ok(RequestRec { value, data })
    }
}

/// Initialization state handed to a joining member. The request cache is
/// deliberately absent; bodies are retrieved lazily by reqid.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct WelcomeRec {
    pub istart: Paxid,
    pub alist: Vec<AcceptorRec>,
    pub ilist: Vec<InstanceRec>,
}

impl WelcomeRec {
    pub fn pack(&self, w: &mut DataMut) {
        w.put_u32_be(self.istart);
        w.put_varint(self.alist.len());
        for a in &self.alist {
            a.pack(w);
        }
        w.put_varint(self.ilist.len());
        for i in &self.ilist {
            i.pack(w);
        }
    }

    pub fn unpack(r: &mut DataReader) -> Result<WelcomeRec, WireError> {
        let istart = r.get_u32_be()?;
        let alist = unpack_array(r, AcceptorRec::unpack)?;
        let ilist = unpack_array(r, InstanceRec::unpack)?;
        Ok(WelcomeRec { istart, alist, ilist })
    }
}

/// Read a varint-prefixed array. The claimed element count is sanity-checked
/// against the bytes actually available before anything is allocated.
fn unpack_array<'a, T, F>(r: &mut DataReader<'a>, unpack: F) -> Result<Vec<T>, WireError>
where
    F: Fn(&mut DataReader<'a>) -> Result<T, WireError>,
{
    let count = r.get_varint()?;
    if count > r.remaining() {
        return Err(WireError::BadLength);
    }
    let mut v = Vec::with_capacity(count);
    for _ in 0..count {
        v.push(unpack(r)?);
    }
    Ok(v)
}

/// One complete decoded protocol message.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Message {
    Prepare(Header),
    Promise(Header, Vec<InstanceRec>),
    Decree(Header, Value),
    Accept(Header, Value),
    Commit(Header, Value),
    Request(Header, RequestRec),
    Redirect(Header),
    Welcome(Header, WelcomeRec),
    Hello(Header),
    Retrieve(Header, Paxid, ReqId),
    Resend(Header, RequestRec),
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Message::Prepare(hdr) => hdr,
            Message::Promise(hdr, _) => hdr,
            Message::Decree(hdr, _) => hdr,
            Message::Accept(hdr, _) => hdr,
            Message::Commit(hdr, _) => hdr,
            Message::Request(hdr, _) => hdr,
            Message::Redirect(hdr) => hdr,
            Message::Welcome(hdr, _) => hdr,
            Message::Hello(hdr) => hdr,
            Message::Retrieve(hdr, _, _) => hdr,
            Message::Resend(hdr, _) => hdr,
        }
    }

    /// Encode the message payload (unframed).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = DataMut::with_capacity(64);
        self.header().pack(&mut w);
        match self {
            Message::Prepare(_) | Message::Redirect(_) | Message::Hello(_) => (),
            Message::Promise(_, ilist) => {
                w.put_varint(ilist.len());
                for i in ilist {
                    i.pack(&mut w);
                }
            }
            Message::Decree(_, val) | Message::Accept(_, val) | Message::Commit(_, val) => {
                val.pack(&mut w);
            }
            Message::Request(_, req) | Message::Resend(_, req) => {
                req.pack(&mut w);
            }
            Message::Welcome(_, info) => {
                info.pack(&mut w);
            }
            Message::Retrieve(_, paxid, reqid) => {
                w.put_u32_be(*paxid);
                w.put_u32_be(reqid.id);
                w.put_u32_be(reqid.gen);
            }
        }
        w.finalize()
    }

    /// Decode one message payload. The opcode in the header selects the body
    /// shape; trailing garbage is tolerated only as an empty remainder.
    pub fn decode(payload: &[u8]) -> Result<Message, WireError> {
        let mut r = DataReader::new(payload);
        let hdr = Header::unpack(&mut r)?;

        let msg = match hdr.op {
            Opcode::Prepare => Message::Prepare(hdr),
            Opcode::Redirect => Message::Redirect(hdr),
            Opcode::Hello => Message::Hello(hdr),
            Opcode::Promise => {
                let ilist = unpack_array(&mut r, InstanceRec::unpack)?;
                Message::Promise(hdr, ilist)
            }
            Opcode::Decree => Message::Decree(hdr, Value::unpack(&mut r)?),
            Opcode::Accept => Message::Accept(hdr, Value::unpack(&mut r)?),
            Opcode::Commit => Message::Commit(hdr, Value::unpack(&mut r)?),
            Opcode::Request => Message::Request(hdr, RequestRec::unpack(&mut r)?),
            Opcode::Resend => Message::Resend(hdr, RequestRec::unpack(&mut r)?),
            Opcode::Welcome => Message::Welcome(hdr, WelcomeRec::unpack(&mut r)?),
            Opcode::Retrieve => {
                let paxid = r.get_u32_be()?;
                let id = r.get_u32_be()?;
                let gen = r.get_u32_be()?;
                Message::Retrieve(hdr, paxid, ReqId::new(id, gen))
            }
        };

        if r.remaining() != 0 {
            return Err(WireError::BadLength);
        }
        Ok(msg)
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(payload);
    h.finalize()
}

/// Wrap an encoded payload in a stream frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut w = DataMut::with_capacity(payload.len() + 8);
    w.put_varint(payload.len());
    w.put_u32_be(checksum(payload));
    let mut v = w.finalize();
    v.extend_from_slice(payload);
    v
}

/// Per-connection reassembly buffer for framed messages.
///
/// Transport reads are pushed in as they arrive; complete payloads are pulled
/// out one at a time, preserving the peer's send order.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> FrameBuffer {
        FrameBuffer { buf: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed. A checksum failure consumes
    /// the bad frame and returns the error so the caller can drop it without
    /// desynchronizing the stream. Oversize and malformed lengths poison the
    /// stream; the caller should close the connection.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        let (len, crc, header_sz) = {
            let mut r = DataReader::new(&self.buf);
            let len = match r.get_varint() {
                Ok(len) => len,
                Err(ReadError::Truncated) => return Ok(None),
                Err(e) => return Err(WireError::from(e)),
            };
            if len > MAX_FRAME {
                return Err(WireError::Oversize);
            }
            let crc = match r.get_u32_be() {
                Ok(crc) => crc,
                Err(_) => return Ok(None),
            };
            (len, crc, self.buf.len() - r.remaining())
        };

        if self.buf.len() < header_sz + len {
            return Ok(None);
        }

        let payload: Vec<u8> = self.buf[header_sz..header_sz + len].to_vec();
        self.buf.drain(..header_sz + len);

        if checksum(&payload) != crc {
            return Err(WireError::BadChecksum);
        }
        Ok(Some(payload))
    }
}
