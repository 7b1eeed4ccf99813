/*! Composes the link, datagram, and memory layers into one runnable
LCC node, per spec.md §5's single-threaded cooperative event loop.

Each layer only knows about the layer directly below it through plain
values passed at call time (`&mut DatagramService` handed into
`MemoryService`'s methods, and so on); cross-layer callback
registration (`Link::on_frame_out`, `Link::on_message_in`,
`DatagramService::on_message_out`) only ever pushes a tagged value into
a queue [`Node`] owns, never captures a sibling service. [`Node::tick`]
is the one place that drains those queues and drives the services
forward — the flat dispatch loop spec.md §9 asks for instead of a
callback graph.
*/
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use log::{debug, warn};

use crate::datagram::DatagramService;
use crate::error::Error;
use crate::frame::CanFrame;
use crate::gridconnect::{self, GridConnectDecoder};
use crate::link::Link;
use crate::memory::{MemoryReadMemo, MemoryService, MemoryWriteMemo};
use crate::message::Message;
use crate::node_id::NodeID;

type FrameQueue = Rc<RefCell<VecDeque<CanFrame>>>;
type MessageQueue = Rc<RefCell<VecDeque<Message>>>;
type DatagramQueue = Rc<RefCell<VecDeque<(NodeID, Vec<u8>)>>>;

/// One LCC node: the CAN link layer plus the datagram and memory
/// services built on top of it, wired together without any service
/// holding a reference to another.
pub struct Node {
    id: NodeID,
    link: Link,
    datagram: DatagramService,
    memory: MemoryService,
    decoder: GridConnectDecoder,
    frames_out: FrameQueue,
    messages_in: MessageQueue,
    messages_out: MessageQueue,
    datagrams_in: DatagramQueue,
}

impl Node {
    /// Build a node for `id`. Call [`Node::physical_layer_up`] once a
    /// transport is attached.
    pub fn new(id: NodeID) -> Self {
        let mut link = Link::new(id);
        let mut datagram = DatagramService::new(id);
        let memory = MemoryService::new(id);

        let frames_out: FrameQueue = Rc::new(RefCell::new(VecDeque::new()));
        let messages_in: MessageQueue = Rc::new(RefCell::new(VecDeque::new()));
        let messages_out: MessageQueue = Rc::new(RefCell::new(VecDeque::new()));
        let datagrams_in: DatagramQueue = Rc::new(RefCell::new(VecDeque::new()));

        let q = frames_out.clone();
        link.on_frame_out(move |f| q.borrow_mut().push_back(f));
        let q = messages_in.clone();
        link.on_message_in(move |m| q.borrow_mut().push_back(m));
        let q = messages_out.clone();
        datagram.on_message_out(move |m| q.borrow_mut().push_back(m));
        let q = datagrams_in.clone();
        datagram.on_receive(move |peer, data| {
            q.borrow_mut().push_back((peer, data.to_vec()));
            Ok(false)
        });

        Self {
            id,
            link,
            datagram,
            memory,
            decoder: GridConnectDecoder::new(),
            frames_out,
            messages_in,
            messages_out,
            datagrams_in,
        }
    }

    /// This node's identity.
    pub fn id(&self) -> NodeID {
        self.id
    }

    /// Begin alias arbitration. Call once the transport is connected.
    pub fn physical_layer_up(&mut self, now: Instant) {
        self.link.physical_layer_up(now);
    }

    /// Tear the link down (sends AMR).
    pub fn physical_layer_down(&mut self) {
        self.link.physical_layer_down();
    }

    /// Feed raw bytes read from the transport into the node.
    pub fn ingest_bytes(&mut self, bytes: &[u8], now: Instant) -> Result<(), Error> {
        let frames = self.decoder.receive_string(bytes)?;
        for frame in frames {
            self.link.deliver_frame(frame, now)?;
        }
        Ok(())
    }

    /// Drain and return every GridConnect ASCII line queued for the
    /// transport since the last call.
    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        self.frames_out.borrow_mut().drain(..).map(|f| gridconnect::send(&f)).collect()
    }

    /// Advance every layer by one event-loop pass: dispatch any
    /// messages/datagrams queued by callbacks, advance timers, and
    /// collect anything those layers now want sent.
    pub fn tick(&mut self, now: Instant) -> Result<(), Error> {
        self.link.tick(now)?;

        let inbound_messages: Vec<_> = self.messages_in.borrow_mut().drain(..).collect();
        for msg in inbound_messages {
            self.datagram.deliver_message(msg, now);
        }

        self.datagram.tick(now);

        let inbound_datagrams: Vec<_> = self.datagrams_in.borrow_mut().drain(..).collect();
        for (peer, data) in inbound_datagrams {
            self.memory.deliver_datagram(peer, &data, &mut self.datagram, now);
        }

        self.memory.tick(&mut self.datagram, now);

        let outbound_messages: Vec<_> = self.messages_out.borrow_mut().drain(..).collect();
        for msg in outbound_messages {
            if let Err(e) = self.link.send_message(&msg) {
                warn!("node: dropping outbound message, link rejected it: {e}");
            }
        }

        Ok(())
    }

    /// Submit a raw datagram write to a peer, bypassing the memory
    /// service (queued if one is already in flight to that peer).
    pub fn submit_datagram_write(&mut self, memo: crate::datagram::DatagramWriteMemo, now: Instant) {
        self.datagram.submit_write(memo, now);
    }

    /// Cancel the in-flight or queued raw datagram write to `peer`.
    pub fn cancel_datagram(&mut self, peer: NodeID) {
        self.datagram.cancel(peer);
    }

    /// Submit a memory read to a peer (queued if one is already in
    /// flight to that peer).
    pub fn submit_memory_read(&mut self, memo: MemoryReadMemo, now: Instant) {
        self.memory.submit_read(memo, &mut self.datagram, now);
    }

    /// Submit a memory write to a peer (queued if one is already in
    /// flight to that peer).
    pub fn submit_memory_write(&mut self, memo: MemoryWriteMemo, now: Instant) {
        self.memory.submit_write(memo, &mut self.datagram, now);
    }

    /// Cancel every queued and in-flight memory operation to `peer`.
    pub fn cancel_memory(&mut self, peer: NodeID) {
        self.memory.cancel(peer, &mut self.datagram);
    }

    /// Advance a [`crate::cdi::CdiDownload`] by one step.
    pub fn step_cdi_download(&mut self, download: &mut crate::cdi::CdiDownload, now: Instant) -> Option<Vec<u8>> {
        download.step(&mut self.memory, &mut self.datagram, now)
    }

    /// Access the link layer, e.g. to pre-seed a peer's alias for
    /// tests or to inspect arbitration state.
    pub fn link(&mut self) -> &mut Link {
        &mut self.link
    }

    /// Register an additional datagram receive listener, run after the
    /// node's own (which always queues a copy for the memory service
    /// and returns `false`). See [`DatagramService::on_receive`].
    pub fn on_datagram_receive<F>(&mut self, f: F)
    where
        F: FnMut(NodeID, &[u8]) -> crate::datagram::ReceiveResult + 'static,
    {
        self.datagram.on_receive(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{MTI, build_header, encode_addressed_data, Continuation};
    use crate::alias::Alias;

    fn node_id(s: &str) -> NodeID {
        NodeID::from_dotted(s).unwrap()
    }

    #[test]
    fn arbitration_drains_as_gridconnect_frames() {
        let mut n = Node::new(node_id("05.01.01.01.03.01"));
        let mut now = Instant::now();
        n.physical_layer_up(now);
        let out = n.drain_outbound();
        assert_eq!(out.len(), 1);
        assert!(String::from_utf8(out[0].clone()).unwrap().starts_with(":X"));

        for _ in 0..4 {
            now += crate::link::CID_SPACING;
            n.tick(now).unwrap();
        }
        assert_eq!(n.link().state(), crate::link::LinkState::Permitted);
        // CID2..CID4, then RID + AMD.
        assert_eq!(n.drain_outbound().len(), 5);
    }

    #[test]
    fn memory_read_round_trips_through_node() {
        let local = node_id("05.01.01.01.03.01");
        let peer = node_id("02.01.57.00.04.9C");
        let mut n = Node::new(local);
        n.link().learn_peer(Alias::new(0x123), peer);
        n.link().learn_peer(Alias::new(0xABC), local);
        // Force the link straight to Permitted with our own alias so
        // send_message can resolve a source alias.
        n.physical_layer_up(Instant::now());
        let mut now = Instant::now();
        for _ in 0..4 {
            now += crate::link::CID_SPACING;
            n.tick(now).unwrap();
        }
        n.drain_outbound();

        let got = Rc::new(RefCell::new(None));
        let g2 = got.clone();
        let memo = crate::memory::MemoryReadMemo {
            peer,
            size: 4,
            space: crate::memory::Space::Config,
            address: 0,
            on_ok: Box::new(move |data| *g2.borrow_mut() = Some(data)),
            on_fail: Box::new(|e| panic!("unexpected fail: {e}")),
        };
        n.submit_memory_read(memo, now);
        n.tick(now).unwrap();
        let out = n.drain_outbound();
        // The 7-byte request datagram is chunked into two 6-byte-max
        // addressed CAN frames.
        assert_eq!(out.len(), 2);

        let header = build_header(0, MTI::DatagramReceivedOk.value(), 0x123);
        let data = encode_addressed_data(Continuation::Only, 0xABC, &[]);
        n.ingest_bytes(&gridconnect::send(&CanFrame::new(header, data).unwrap()), now)
            .unwrap();
        n.tick(now).unwrap();

        let reply_payload = vec![0x20u8, 0x51, 0, 0, 0, 0, 9, 9, 9, 9];
        let header = build_header(0, MTI::Datagram.value(), 0x123);
        let data = encode_addressed_data(Continuation::Only, 0xABC, &reply_payload);
        n.ingest_bytes(&gridconnect::send(&CanFrame::new(header, data).unwrap()), now)
            .unwrap();
        n.tick(now).unwrap();

        assert_eq!(got.borrow().as_ref().unwrap(), &vec![9, 9, 9, 9]);
        debug!("memory_read_round_trips_through_node ok");
    }
}
