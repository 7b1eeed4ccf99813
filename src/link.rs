/*! CAN link layer: alias arbitration and frame <-> message translation.

One [`Link`] owns exactly one physical CAN segment (in practice, one
TCP/GridConnect connection to a gateway). It is the only place an
[`Alias`] and a [`NodeID`] are ever in the same scope: every layer above
this one speaks [`Message`]s addressed by `NodeID` only, per spec.md
§3/§4.2.

The state machine is `Initial -> Inhibited -> Permitted -> Stopping ->
Initial`. Arbitration (CID1..CID4, RID, AMD) and reassembly are both
driven from here; nothing below the link layer (the GridConnect codec)
or above it (datagram/memory services) knows about aliases at all.
*/
use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::alias::{Alias, AliasTable};
use crate::error::Error;
use crate::frame::{CanFrame, Continuation, MTI, build_header, decode_addressed_data, encode_addressed_data};
use crate::message::Message;
use crate::node_id::NodeID;

/// Minimum spacing between successive CID frames, and the window during
/// which a competing RID/AMD for the same candidate alias aborts
/// arbitration.
pub const CID_SPACING: Duration = Duration::from_millis(200);

/// How many times a candidate alias may be discarded to collision before
/// arbitration gives up with [`Error::AliasExhausted`].
pub const MAX_ARBITRATION_ATTEMPTS: u32 = 8;

/// How long an addressed frame from an unrecognised source alias is held
/// awaiting that alias's AMD before being discarded.
pub const PENDING_ALIAS_TIMEOUT: Duration = Duration::from_millis(800);

/// Control-frame variable-field tags. These never reach a [`Message`];
/// the link layer consumes them entirely as part of arbitration.
mod control {
    // Variable field is only 14 bits wide; these constants all leave the
    // low 10 bits free to carry a node-ID slice.
    pub const CID1: u16 = 0x2400;
    pub const CID2: u16 = 0x2800;
    pub const CID3: u16 = 0x2C00;
    pub const CID4: u16 = 0x3000;
    pub const RID: u16 = 0x0700;
    pub const AMD: u16 = 0x0701;
    pub const AMR: u16 = 0x0703;
}

fn is_cid(field: u16) -> Option<u8> {
    match field & 0xFC00 {
        control::CID1 => Some(1),
        control::CID2 => Some(2),
        control::CID3 => Some(3),
        control::CID4 => Some(4),
        _ => None,
    }
}

/// Per-link arbitration/operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No physical layer, no candidate alias.
    Initial,
    /// Arbitrating a candidate alias; not yet permitted to send/receive
    /// addressed traffic.
    Inhibited,
    /// Alias claimed; normal operation.
    Permitted,
    /// Tearing down: AMR has been (or is about to be) sent.
    Stopping,
}

/// A candidate alias derived from the node's 48-bit ID, the same way a
/// real node would: a cheap, deterministic hash so repeated arbitration
/// after a collision doesn't reuse the same candidate.
fn derive_candidate(node_id: NodeID, attempt: u32) -> Alias {
    // splitmix64, seeded from the node ID and the attempt counter so
    // successive attempts after a collision produce different aliases.
    let mut z = node_id
        .raw()
        .wrapping_add(0x9E3779B97F4A7C15u64.wrapping_mul(attempt as u64 + 1));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^= z >> 31;
    let mut v = (z as u16) & Alias::MASK;
    if v == 0 {
        v = 1;
    }
    Alias::new(v)
}

fn cid_frame(stage: u8, candidate: Alias, node_id: NodeID) -> CanFrame {
    let tag = match stage {
        1 => control::CID1,
        2 => control::CID2,
        3 => control::CID3,
        _ => control::CID4,
    };
    // Each CID stage carries a different 10-bit slice of the node ID so a
    // peer racing for the same candidate alias can tell which of its own
    // CID frames collided.
    let raw = node_id.raw();
    let slice = match stage {
        1 => (raw >> 30) & 0x3FF,
        2 => (raw >> 20) & 0x3FF,
        3 => (raw >> 10) & 0x3FF,
        _ => raw & 0x3FF,
    } as u16;
    CanFrame::new(build_header(0, tag | slice, candidate.raw()), vec![])
        .expect("CID frame fields are always in range")
}

fn rid_frame(candidate: Alias) -> CanFrame {
    CanFrame::new(build_header(0, control::RID, candidate.raw()), vec![])
        .expect("RID frame fields are always in range")
}

fn amd_frame(alias: Alias, node_id: NodeID) -> CanFrame {
    CanFrame::new(build_header(0, control::AMD, alias.raw()), node_id.to_bytes().to_vec())
        .expect("AMD frame fields are always in range")
}

fn amr_frame(alias: Alias, node_id: NodeID) -> CanFrame {
    CanFrame::new(build_header(0, control::AMR, alias.raw()), node_id.to_bytes().to_vec())
        .expect("AMR frame fields are always in range")
}

/// One in-progress multi-frame reassembly, keyed by `(src alias, dst
/// alias, MTI)` per spec.md §4.2.
#[derive(Debug, Default)]
struct Reassembly {
    data: Vec<u8>,
}

/// A frame held because its source alias is not yet in the alias table,
/// awaiting that alias's AMD.
struct PendingFrame {
    frame: CanFrame,
    deadline: Instant,
}

/// The CAN link layer for one physical connection.
pub struct Link {
    node_id: NodeID,
    state: LinkState,
    alias: Option<Alias>,
    candidate_attempt: u32,
    cid_stage: u8,
    next_cid_deadline: Option<Instant>,
    table: AliasTable,
    reassembly: HashMap<(u16, u16, u16), Reassembly>,
    pending: HashMap<u16, Vec<PendingFrame>>,
    frame_out: Vec<Box<dyn FnMut(CanFrame)>>,
    message_in: Vec<Box<dyn FnMut(Message)>>,
}

impl Link {
    /// Create a link for the given local node identity. The link starts
    /// in [`LinkState::Initial`]; call [`Link::physical_layer_up`] once
    /// the transport is connected.
    pub fn new(node_id: NodeID) -> Self {
        Self {
            node_id,
            state: LinkState::Initial,
            alias: None,
            candidate_attempt: 0,
            cid_stage: 0,
            next_cid_deadline: None,
            table: AliasTable::new(),
            reassembly: HashMap::new(),
            pending: HashMap::new(),
            frame_out: Vec::new(),
            message_in: Vec::new(),
        }
    }

    /// Register a sink for frames this link wants to put on the wire
    /// (to be GridConnect-encoded and written to the transport).
    pub fn on_frame_out<F: FnMut(CanFrame) + 'static>(&mut self, f: F) {
        self.frame_out.push(Box::new(f));
    }

    /// Register a listener for reassembled/translated inbound messages.
    pub fn on_message_in<F: FnMut(Message) + 'static>(&mut self, f: F) {
        self.message_in.push(Box::new(f));
    }

    /// Current state machine state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// This link's claimed alias, once [`LinkState::Permitted`].
    pub fn alias(&self) -> Option<Alias> {
        self.alias
    }

    fn emit_frame(&mut self, frame: CanFrame) {
        for f in &mut self.frame_out {
            f(frame.clone());
        }
    }

    /// Begin alias arbitration. Call once the transport is up.
    pub fn physical_layer_up(&mut self, now: Instant) {
        self.state = LinkState::Inhibited;
        self.candidate_attempt = 0;
        self.start_candidate(now);
    }

    fn start_candidate(&mut self, now: Instant) {
        let candidate = derive_candidate(self.node_id, self.candidate_attempt);
        self.alias = Some(candidate);
        self.cid_stage = 1;
        self.next_cid_deadline = Some(now + CID_SPACING);
        let frame = cid_frame(1, candidate, self.node_id);
        trace!("link: arbitrating candidate alias {candidate}");
        self.emit_frame(frame);
    }

    fn restart_with_new_candidate(&mut self, now: Instant) -> Result<(), Error> {
        self.candidate_attempt += 1;
        if self.candidate_attempt >= MAX_ARBITRATION_ATTEMPTS {
            self.state = LinkState::Initial;
            self.alias = None;
            return Err(Error::AliasExhausted(self.candidate_attempt));
        }
        self.start_candidate(now);
        Ok(())
    }

    /// Advance timers: CID spacing, pending-alias expiry. Call
    /// periodically (e.g. once per event-loop pass) with the current
    /// monotonic time.
    pub fn tick(&mut self, now: Instant) -> Result<(), Error> {
        if self.state == LinkState::Inhibited
            && let Some(deadline) = self.next_cid_deadline
            && now >= deadline
        {
            if self.cid_stage < 4 {
                self.cid_stage += 1;
                let candidate = self.alias.expect("candidate set while Inhibited");
                let frame = cid_frame(self.cid_stage, candidate, self.node_id);
                self.next_cid_deadline = Some(now + CID_SPACING);
                self.emit_frame(frame);
            } else {
                self.complete_arbitration();
            }
        }
        for frames in self.pending.values_mut() {
            frames.retain(|p| p.deadline > now);
        }
        self.pending.retain(|alias, frames| {
            if frames.is_empty() {
                debug!("link: pending frames for alias {:#05x} expired awaiting AMD", alias);
                false
            } else {
                true
            }
        });
        Ok(())
    }

    fn complete_arbitration(&mut self) {
        let candidate = self.alias.expect("candidate set while Inhibited");
        self.emit_frame(rid_frame(candidate));
        self.emit_frame(amd_frame(candidate, self.node_id));
        self.table.insert(candidate, self.node_id);
        self.state = LinkState::Permitted;
        self.next_cid_deadline = None;
        debug!("link: alias {candidate} permitted for {}", self.node_id);
    }

    /// Tear the link down: send AMR and clear the alias table.
    pub fn physical_layer_down(&mut self) {
        if let Some(alias) = self.alias.take() {
            self.state = LinkState::Stopping;
            self.emit_frame(amr_frame(alias, self.node_id));
        }
        self.table.clear();
        self.reassembly.clear();
        self.pending.clear();
        self.state = LinkState::Initial;
    }

    /// Feed one inbound CAN frame (already decoded from GridConnect
    /// ASCII) into the link layer.
    pub fn deliver_frame(&mut self, frame: CanFrame, now: Instant) -> Result<(), Error> {
        let field = frame.variable_field();
        if let Some(_stage) = is_cid(field) {
            return self.handle_peer_cid_or_claim(frame.source_alias(), now);
        }
        match field {
            control::RID => self.handle_peer_cid_or_claim(frame.source_alias(), now),
            control::AMD => self.handle_peer_amd(frame.source_alias(), &frame.data, now),
            control::AMR => {
                self.table.remove_alias(Alias::new(frame.source_alias()));
                Ok(())
            }
            _ => self.handle_message_frame(frame, now),
        }
    }

    /// Handle an inbound AMD: the same collision check an RID triggers,
    /// plus recording the alias<->NodeID mapping it declares (spec.md
    /// §4.2: "Incoming AMD/AMR update the alias table") and re-running
    /// any frames held in [`Self::pending`] awaiting exactly this
    /// alias's AMD.
    fn handle_peer_amd(&mut self, claimed_alias: u16, data: &[u8], now: Instant) -> Result<(), Error> {
        self.handle_peer_cid_or_claim(claimed_alias, now)?;
        if self.alias == Some(Alias::new(claimed_alias)) {
            // The collision check above just reclaimed this value as
            // our own candidate; it doesn't describe a peer.
            return Ok(());
        }
        let Ok(bytes) = <[u8; 6]>::try_from(data) else {
            warn!("link: AMD from alias {claimed_alias:#05x} missing 6-byte NodeID, dropping");
            return Ok(());
        };
        let alias = Alias::new(claimed_alias);
        let node = NodeID::from_bytes(bytes);
        debug!("link: learned {node} at alias {alias} via AMD");
        self.table.insert(alias, node);
        if let Some(frames) = self.pending.remove(&claimed_alias) {
            debug!("link: re-delivering {} frame(s) held pending alias {alias}", frames.len());
            for p in frames {
                self.deliver_frame(p.frame, now)?;
            }
        }
        Ok(())
    }

    fn handle_peer_cid_or_claim(&mut self, claimed_alias: u16, now: Instant) -> Result<(), Error> {
        if self.state == LinkState::Inhibited
            && let Some(candidate) = self.alias
            && candidate.raw() == claimed_alias
        {
            warn!("link: alias collision on candidate {candidate:#05x}, restarting arbitration");
            return self.restart_with_new_candidate(now);
        }
        if self.state == LinkState::Permitted
            && let Some(mine) = self.alias
            && mine.raw() == claimed_alias
        {
            warn!("link: alias collision on permitted alias {mine:#05x}, re-arbitrating");
            self.table.remove_alias(mine);
            self.state = LinkState::Inhibited;
            self.candidate_attempt = 0;
            self.start_candidate(now);
        }
        Ok(())
    }

    fn handle_message_frame(&mut self, frame: CanFrame, now: Instant) -> Result<(), Error> {
        let field = frame.variable_field();
        let is_global = field & 0x0008 == 0;
        if is_global {
            let mti = MTI::from_value(field);
            let source = match self.table.node_for(Alias::new(frame.source_alias())) {
                Some(n) => n,
                None => {
                    self.hold_pending(frame, now);
                    return Ok(());
                }
            };
            self.deliver_message(Message::global(mti, source, frame.data));
            return Ok(());
        }
        let (cont, dest_alias, payload) = match decode_addressed_data(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                warn!("link: dropping malformed addressed frame: {e}");
                return Ok(());
            }
        };
        let source = match self.table.node_for(Alias::new(frame.source_alias())) {
            Some(n) => n,
            None => {
                self.hold_pending(frame, now);
                return Ok(());
            }
        };
        let mti = MTI::from_value(field);
        let key = (frame.source_alias(), dest_alias, field);
        match cont {
            Continuation::Only => {
                let dest = self.table.node_for(Alias::new(dest_alias));
                self.deliver_addressed(mti, source, dest, dest_alias, payload.to_vec());
            }
            Continuation::First => {
                self.reassembly.insert(
                    key,
                    Reassembly {
                        data: payload.to_vec(),
                    },
                );
            }
            Continuation::Middle => {
                if let Some(r) = self.reassembly.get_mut(&key) {
                    r.data.extend_from_slice(payload);
                } else {
                    warn!("link: continuation frame for unknown reassembly {key:?}, dropping");
                }
            }
            Continuation::Last => {
                if let Some(mut r) = self.reassembly.remove(&key) {
                    r.data.extend_from_slice(payload);
                    let dest = self.table.node_for(Alias::new(dest_alias));
                    self.deliver_addressed(mti, source, dest, dest_alias, r.data);
                } else {
                    warn!("link: final continuation frame for unknown reassembly {key:?}, dropping");
                }
            }
        }
        Ok(())
    }

    fn deliver_addressed(
        &mut self,
        mti: MTI,
        source: NodeID,
        dest: Option<NodeID>,
        dest_alias: u16,
        data: Vec<u8>,
    ) {
        let Some(dest) = dest else {
            debug!("link: addressed message for unknown destination alias {dest_alias:#05x}, dropping");
            return;
        };
        self.deliver_message(Message::addressed(mti, source, dest, data));
    }

    fn deliver_message(&mut self, msg: Message) {
        for f in &mut self.message_in {
            f(msg.clone());
        }
    }

    fn hold_pending(&mut self, frame: CanFrame, now: Instant) {
        let alias = frame.source_alias();
        debug!("link: holding frame from unresolved alias {alias:#05x} pending AMD");
        self.pending.entry(alias).or_default().push(PendingFrame {
            frame,
            deadline: now + PENDING_ALIAS_TIMEOUT,
        });
    }

    /// Translate and send a high-level message, fragmenting as needed.
    /// Returns [`Error::AliasCollision`]-free `Ok(())`, or an error if
    /// the destination's alias is unknown to this link.
    pub fn send_message(&mut self, msg: &Message) -> Result<(), Error> {
        let source_alias = self
            .alias
            .ok_or_else(|| Error::MalformedFrame("link has no alias yet".into()))?;
        match msg.destination {
            None => {
                let header = build_header(0, msg.mti.value(), source_alias.raw());
                if msg.data.is_empty() {
                    self.emit_frame(CanFrame::new(header, vec![])?);
                } else {
                    for chunk in msg.data.chunks(8) {
                        self.emit_frame(CanFrame::new(header, chunk.to_vec())?);
                    }
                }
                Ok(())
            }
            Some(dest) => {
                let dest_alias = self
                    .table
                    .alias_for(dest)
                    .ok_or_else(|| Error::MalformedFrame(format!("no known alias for {dest}")))?;
                let header = build_header(0, msg.mti.value(), source_alias.raw());
                let chunks: Vec<&[u8]> = if msg.data.is_empty() {
                    vec![&[][..]]
                } else {
                    msg.data.chunks(6).collect()
                };
                let n = chunks.len();
                for (i, chunk) in chunks.into_iter().enumerate() {
                    let cont = if n == 1 {
                        Continuation::Only
                    } else if i == 0 {
                        Continuation::First
                    } else if i == n - 1 {
                        Continuation::Last
                    } else {
                        Continuation::Middle
                    };
                    let data = encode_addressed_data(cont, dest_alias.raw(), chunk);
                    self.emit_frame(CanFrame::new(header, data)?);
                }
                Ok(())
            }
        }
    }

    /// Look up the NodeID behind an alias on this link, if known.
    pub fn node_for_alias(&self, alias: Alias) -> Option<NodeID> {
        self.table.node_for(alias)
    }

    /// Look up the alias currently assigned to a NodeID on this link.
    pub fn alias_for_node(&self, node: NodeID) -> Option<Alias> {
        self.table.alias_for(node)
    }

    /// Directly record an alias/NodeID mapping, e.g. when a test or a
    /// higher layer already knows a peer's alias out of band.
    pub fn learn_peer(&mut self, alias: Alias, node: NodeID) {
        self.table.insert(alias, node);
    }
}
