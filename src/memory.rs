/*! Memory configuration protocol: Read/Write requests over the
datagram service, with per-peer queueing and pure serialization
helpers, per spec.md §4.4/§6.

This module implements the *requester* side only: issuing `Read`/
`Write` requests to a peer and decoding its replies. Serving other
nodes' requests against this node's own memory spaces is not part of
spec.md's described operations (every scenario and the CDI consumer
example is this node acting as the requester) and is not implemented;
see `DESIGN.md`.

A memory request is layered on top of one [`crate::datagram`]
transaction (the request datagram) followed by a second, independent
datagram transaction initiated by the peer (carrying the reply) —
exactly scenario S1/S2 in spec.md §8. [`MemoryService`] therefore
tracks each peer through two stages: *awaiting ack* (the request
datagram's `Datagram_Received_OK`/`Datagram_Rejected`) and *awaiting
reply* (the peer's own reply datagram).
*/
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use log::warn;

use crate::datagram::{DatagramService, DatagramWriteMemo};
use crate::error::Error;
use crate::node_id::NodeID;

/// A memory-configuration address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// `0xFF`, the CDI space. Short form.
    Cdi,
    /// `0xFE`, all of memory. Short form.
    AllMemory,
    /// `0xFD`, the node's configuration space. Short form.
    Config,
    /// Any other space, sent with the explicit-space long form.
    Other(u8),
}

impl Space {
    /// The raw space-number byte.
    pub fn raw(self) -> u8 {
        match self {
            Space::Cdi => 0xFF,
            Space::AllMemory => 0xFE,
            Space::Config => 0xFD,
            Space::Other(v) => v,
        }
    }

    /// Build a `Space` from a raw byte, recognising the three
    /// well-known short-form spaces.
    pub fn from_raw(v: u8) -> Self {
        match v {
            0xFF => Space::Cdi,
            0xFE => Space::AllMemory,
            0xFD => Space::Config,
            other => Space::Other(other),
        }
    }

    fn is_short_form(self) -> bool {
        !matches!(self, Space::Other(_))
    }

    fn space_bits(self) -> u8 {
        match self {
            Space::Cdi => 3,
            Space::AllMemory => 2,
            Space::Config => 1,
            Space::Other(_) => 0,
        }
    }
}

const READ_BASE: u8 = 0x40;
const WRITE_BASE: u8 = 0x00;

/// Largest data chunk that fits a short-form request/reply datagram
/// within [`crate::datagram::MAX_PAYLOAD`] (6 header bytes: protocol
/// marker, command byte, 4-byte address).
pub const MAX_CHUNK_SHORT: usize = crate::datagram::MAX_PAYLOAD - 6;
/// As [`MAX_CHUNK_SHORT`], but for the long form, which spends one more
/// byte on the explicit space number.
pub const MAX_CHUNK_LONG: usize = MAX_CHUNK_SHORT - 1;

fn max_chunk(space: Space) -> usize {
    if space.is_short_form() {
        MAX_CHUNK_SHORT
    } else {
        MAX_CHUNK_LONG
    }
}

/// Decode a command byte's space encoding: `(uses_byte6_space,
/// space_id)`. When `uses_byte6_space` is true the space number
/// follows explicitly (long form) and `space_id` is meaningless;
/// otherwise `space_id` is one of the three well-known short-form
/// spaces packed into the command byte's low 2 bits.
pub fn space_decode(cmd_byte: u8) -> (bool, u8) {
    match cmd_byte & 0x3 {
        0 => (true, 0),
        1 => (false, 0xFD),
        2 => (false, 0xFE),
        _ => (false, 0xFF),
    }
}

/// Decode bytes as UTF-8, stopping at the first NUL or `max_len`,
/// whichever comes first.
pub fn array_to_string(bytes: &[u8], max_len: usize) -> String {
    let slice = &bytes[..bytes.len().min(max_len)];
    let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    String::from_utf8_lossy(&slice[..end]).into_owned()
}

/// Encode `s` as UTF-8, truncated or NUL-padded to exactly `len` bytes.
pub fn string_to_array(s: &str, len: usize) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.truncate(len);
    bytes.resize(len, 0);
    bytes
}

/// Encode `value` big-endian in exactly `len` bytes.
///
/// Returns [`Error::OutOfRange`] if `value` does not fit.
pub fn int_to_array(value: u64, len: usize) -> Result<Vec<u8>, Error> {
    if len < 8 && value >= (1u64 << (len * 8)) {
        return Err(Error::OutOfRange { bytes: len });
    }
    let full = value.to_be_bytes();
    let mut out = vec![0u8; len];
    let copy_len = full.len().min(len);
    out[len - copy_len..].copy_from_slice(&full[8 - copy_len..]);
    Ok(out)
}

/// A pending memory read.
pub struct MemoryReadMemo {
    /// Peer to read from.
    pub peer: NodeID,
    /// Number of bytes requested.
    pub size: u8,
    /// Address space.
    pub space: Space,
    /// Starting address.
    pub address: u32,
    /// Called with the returned bytes on success. A shorter-than-`size`
    /// chunk (or one containing a NUL, for string reads) signals the
    /// consumer it has reached the end; the CDI loader in
    /// [`crate::cdi`] is the reference example of re-submitting with a
    /// bumped address from inside this callback.
    pub on_ok: Box<dyn FnOnce(Vec<u8>)>,
    /// Called on failure (peer rejection, timeout, or cancellation).
    pub on_fail: Box<dyn FnOnce(Error)>,
}

/// A pending memory write.
pub struct MemoryWriteMemo {
    /// Peer to write to.
    pub peer: NodeID,
    /// Address space.
    pub space: Space,
    /// Starting address.
    pub address: u32,
    /// Bytes to write.
    pub data: Vec<u8>,
    /// Called once the write is confirmed.
    pub on_ok: Box<dyn FnOnce()>,
    /// Called on failure.
    pub on_fail: Box<dyn FnOnce(Error)>,
}

enum PendingOp {
    Read(MemoryReadMemo),
    Write(MemoryWriteMemo),
}

impl PendingOp {
    fn peer(&self) -> NodeID {
        match self {
            PendingOp::Read(m) => m.peer,
            PendingOp::Write(m) => m.peer,
        }
    }

    fn fail(self, e: Error) {
        match self {
            PendingOp::Read(m) => (m.on_fail)(e),
            PendingOp::Write(m) => (m.on_fail)(e),
        }
    }

    fn request_payload(&self) -> Vec<u8> {
        match self {
            PendingOp::Read(m) => {
                let mut v = vec![0x20u8, READ_BASE | m.space.space_bits()];
                v.extend_from_slice(&m.address.to_be_bytes());
                if m.space.is_short_form() {
                    v.push(m.size);
                } else {
                    v.push(m.space.raw());
                    v.push(m.size);
                }
                v
            }
            PendingOp::Write(m) => {
                let mut v = vec![0x20u8, WRITE_BASE | m.space.space_bits()];
                v.extend_from_slice(&m.address.to_be_bytes());
                if m.space.is_short_form() {
                    v.extend_from_slice(&m.data);
                } else {
                    v.push(m.space.raw());
                    v.extend_from_slice(&m.data);
                }
                v
            }
        }
    }
}

/// Either an ack completion (for the request datagram) funnelled back
/// from a [`DatagramWriteMemo`] callback, tagged so [`MemoryService`]
/// can dispatch on it without the callback itself borrowing the
/// service.
type AckEvents = Rc<RefCell<VecDeque<(NodeID, Result<(), Error>)>>>;

/// The memory-configuration service for one local node.
pub struct MemoryService {
    local: NodeID,
    queues: HashMap<NodeID, VecDeque<PendingOp>>,
    awaiting_ack: HashMap<NodeID, PendingOp>,
    awaiting_reply: HashMap<NodeID, PendingOp>,
    ack_events: AckEvents,
}

impl MemoryService {
    /// Create a memory service for `local`.
    pub fn new(local: NodeID) -> Self {
        Self {
            local,
            queues: HashMap::new(),
            awaiting_ack: HashMap::new(),
            awaiting_reply: HashMap::new(),
            ack_events: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Submit a read request, queueing it if another request is
    /// already in flight to `memo.peer`.
    pub fn submit_read(&mut self, memo: MemoryReadMemo, datagram: &mut DatagramService, now: Instant) {
        self.enqueue(PendingOp::Read(memo), datagram, now);
    }

    /// Submit a write request, queueing it if another request is
    /// already in flight to `memo.peer`.
    pub fn submit_write(&mut self, memo: MemoryWriteMemo, datagram: &mut DatagramService, now: Instant) {
        self.enqueue(PendingOp::Write(memo), datagram, now);
    }

    fn enqueue(&mut self, op: PendingOp, datagram: &mut DatagramService, now: Instant) {
        let peer = op.peer();
        let idle = !self.awaiting_ack.contains_key(&peer) && !self.awaiting_reply.contains_key(&peer);
        let queue = self.queues.entry(peer).or_default();
        let was_empty = queue.is_empty();
        queue.push_back(op);
        if idle && was_empty {
            self.dispatch_next(peer, datagram, now);
        }
    }

    fn dispatch_next(&mut self, peer: NodeID, datagram: &mut DatagramService, now: Instant) {
        let Some(queue) = self.queues.get_mut(&peer) else {
            return;
        };
        let Some(op) = queue.pop_front() else {
            return;
        };
        if queue.is_empty() {
            self.queues.remove(&peer);
        }
        let payload = op.request_payload();
        let events_ok = self.ack_events.clone();
        let events_err = self.ack_events.clone();
        let write_memo = match DatagramWriteMemo::new(
            peer,
            payload,
            move || events_ok.borrow_mut().push_back((peer, Ok(()))),
            move |e| events_err.borrow_mut().push_back((peer, Err(e))),
        ) {
            Ok(m) => m,
            Err(e) => {
                op.fail(e);
                return;
            }
        };
        self.awaiting_ack.insert(peer, op);
        datagram.submit_write(write_memo, now);
    }

    /// Advance the service: drain request-ack completions recorded
    /// since the last call and advance each peer's queue accordingly.
    /// Call once per event-loop pass, after `datagram.tick`.
    pub fn tick(&mut self, datagram: &mut DatagramService, now: Instant) {
        let events: Vec<_> = self.ack_events.borrow_mut().drain(..).collect();
        for (peer, outcome) in events {
            match outcome {
                Ok(()) => {
                    if let Some(op) = self.awaiting_ack.remove(&peer) {
                        self.awaiting_reply.insert(peer, op);
                    }
                }
                Err(e) => {
                    if let Some(op) = self.awaiting_ack.remove(&peer) {
                        op.fail(e);
                    }
                    self.dispatch_next(peer, datagram, now);
                }
            }
        }
    }

    /// Feed one inbound datagram payload not otherwise claimed by
    /// another listener. Drops (with a log) any payload that isn't a
    /// reply matching a pending request.
    pub fn deliver_datagram(&mut self, peer: NodeID, data: &[u8], datagram: &mut DatagramService, now: Instant) {
        let Some(op) = self.awaiting_reply.remove(&peer) else {
            warn!("memory: unsolicited datagram from {peer}, dropping");
            return;
        };
        match decode_reply(data) {
            Ok(Reply::Read(bytes)) => match op {
                PendingOp::Read(m) => (m.on_ok)(bytes),
                PendingOp::Write(m) => {
                    warn!("memory: got read reply for a pending write to {peer}");
                    (m.on_fail)(Error::MemoryFault { code: 0xFFFF });
                }
            },
            Ok(Reply::Write) => match op {
                PendingOp::Write(m) => (m.on_ok)(),
                PendingOp::Read(m) => {
                    warn!("memory: got write reply for a pending read to {peer}");
                    (m.on_fail)(Error::MemoryFault { code: 0xFFFF });
                }
            },
            Ok(Reply::Error(code)) => op.fail(Error::MemoryFault { code }),
            Err(e) => op.fail(e),
        }
        self.dispatch_next(peer, datagram, now);
    }

    /// The local node ID this service was built with.
    pub fn local(&self) -> NodeID {
        self.local
    }

    /// Cancel every queued and in-flight operation to `peer`.
    pub fn cancel(&mut self, peer: NodeID, datagram: &mut DatagramService) {
        datagram.cancel(peer);
        if let Some(op) = self.awaiting_ack.remove(&peer) {
            op.fail(Error::Cancelled);
        }
        if let Some(op) = self.awaiting_reply.remove(&peer) {
            op.fail(Error::Cancelled);
        }
        if let Some(queue) = self.queues.remove(&peer) {
            for op in queue {
                op.fail(Error::Cancelled);
            }
        }
    }
}

enum Reply {
    Read(Vec<u8>),
    Write,
    Error(u16),
}

fn decode_reply(data: &[u8]) -> Result<Reply, Error> {
    if data.len() < 6 || data[0] != 0x20 {
        return Err(Error::MalformedFrame("short or unmarked memory reply datagram".into()));
    }
    let cmd = data[1];
    let (uses_byte6_space, _space_id) = space_decode(cmd);
    let mut idx = 6;
    if uses_byte6_space {
        idx += 1;
    }
    let is_error = cmd & 0x08 != 0;
    match cmd & 0xF0 {
        0x50 => {
            if is_error {
                let code = data
                    .get(idx..idx + 2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .unwrap_or(0xFFFF);
                Ok(Reply::Error(code))
            } else {
                Ok(Reply::Read(data[idx.min(data.len())..].to_vec()))
            }
        }
        0x10 => {
            if is_error {
                let code = data
                    .get(idx..idx + 2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .unwrap_or(0xFFFF);
                Ok(Reply::Error(code))
            } else {
                Ok(Reply::Write)
            }
        }
        _ => Err(Error::MalformedFrame(format!("unrecognised memory reply command byte {cmd:#04x}"))),
    }
}
