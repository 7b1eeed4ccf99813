/*! Datagram service: reliable <=64-byte point-to-point transfers.

One in-flight write transaction per peer, FIFO within a peer, no
ordering guarantee across peers, per spec.md §4.3. Built directly on
top of addressed [`Message`]s; this module never touches a
[`crate::frame::CanFrame`] or an alias.
*/
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::Error;
use crate::frame::MTI;
use crate::message::Message;
use crate::node_id::NodeID;

/// Largest payload a single datagram may carry.
pub const MAX_PAYLOAD: usize = 64;

/// Default time to wait for `Datagram_Received_OK`/`Datagram_Rejected`
/// before synthesizing a [`Error::DatagramTimeout`] reject.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// One outbound datagram write transaction.
///
/// A plain value, owned by the service's per-peer queue; it holds no
/// reference back to the service (spec.md §9's "avoid cyclic
/// ownership").
pub struct DatagramWriteMemo {
    /// Destination node.
    pub peer: NodeID,
    /// Payload, at most [`MAX_PAYLOAD`] bytes.
    pub payload: Vec<u8>,
    /// Called once the peer acknowledges the datagram.
    pub on_ok: Box<dyn FnOnce()>,
    /// Called once, with the reason, if the datagram fails: peer
    /// rejection, timeout, or cancellation.
    pub on_reject: Box<dyn FnOnce(Error)>,
}

impl DatagramWriteMemo {
    /// Build a write memo, rejecting oversized payloads up front.
    pub fn new(
        peer: NodeID,
        payload: Vec<u8>,
        on_ok: impl FnOnce() + 'static,
        on_reject: impl FnOnce(Error) + 'static,
    ) -> Result<Self, Error> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::OutOfRange { bytes: MAX_PAYLOAD });
        }
        Ok(Self {
            peer,
            payload,
            on_ok: Box::new(on_ok),
            on_reject: Box::new(on_reject),
        })
    }
}

struct InFlight {
    memo: DatagramWriteMemo,
    deadline: Instant,
    cancelled: bool,
}

/// Outcome returned by a receive listener: `Ok(true)` means the
/// listener already transmitted a reply itself; `Ok(false)` means the
/// service should send `Datagram_Received_OK` on its behalf; `Err`
/// means the listener failed and the datagram should be rejected with
/// `PermanentError`.
pub type ReceiveResult = Result<bool, String>;

/// The datagram service for one local node.
pub struct DatagramService {
    local: NodeID,
    timeout: Duration,
    queues: HashMap<NodeID, VecDeque<DatagramWriteMemo>>,
    inflight: HashMap<NodeID, InFlight>,
    receive_listeners: Vec<Box<dyn FnMut(NodeID, &[u8]) -> ReceiveResult>>,
    message_out: Vec<Box<dyn FnMut(Message)>>,
}

impl DatagramService {
    /// Create a datagram service for `local`, using the default 3s
    /// reply timeout.
    pub fn new(local: NodeID) -> Self {
        Self {
            local,
            timeout: DEFAULT_TIMEOUT,
            queues: HashMap::new(),
            inflight: HashMap::new(),
            receive_listeners: Vec::new(),
            message_out: Vec::new(),
        }
    }

    /// Override the default reply timeout (tests use this to avoid
    /// waiting real wall-clock seconds).
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Register a sink for outbound messages (normally the link layer's
    /// `send_message`).
    pub fn on_message_out<F: FnMut(Message) + 'static>(&mut self, f: F) {
        self.message_out.push(Box::new(f));
    }

    /// Register a receive listener. Listeners run in registration order
    /// on every inbound `Datagram`; see [`ReceiveResult`].
    pub fn on_receive<F: FnMut(NodeID, &[u8]) -> ReceiveResult + 'static>(&mut self, f: F) {
        self.receive_listeners.push(Box::new(f));
    }

    fn send(&mut self, msg: Message) {
        for f in &mut self.message_out {
            f(msg.clone());
        }
    }

    /// Submit a write. If no transaction is currently in flight to
    /// `memo.peer`, it is sent immediately; otherwise it joins that
    /// peer's FIFO queue.
    pub fn submit_write(&mut self, memo: DatagramWriteMemo, now: Instant) {
        let peer = memo.peer;
        self.queues.entry(peer).or_default().push_back(memo);
        if !self.inflight.contains_key(&peer) {
            self.dequeue_and_send(peer, now);
        }
    }

    fn dequeue_and_send(&mut self, peer: NodeID, now: Instant) {
        let Some(queue) = self.queues.get_mut(&peer) else {
            return;
        };
        let Some(memo) = queue.pop_front() else {
            return;
        };
        if queue.is_empty() {
            self.queues.remove(&peer);
        }
        let msg = Message::addressed(MTI::Datagram, self.local, peer, memo.payload.clone());
        self.send(msg);
        self.inflight.insert(
            peer,
            InFlight {
                memo,
                deadline: now + self.timeout,
                cancelled: false,
            },
        );
    }

    fn complete(&mut self, peer: NodeID, now: Instant, outcome: Result<(), Error>) {
        if let Some(inflight) = self.inflight.remove(&peer) {
            let result = if inflight.cancelled {
                Err(Error::Cancelled)
            } else {
                outcome
            };
            match result {
                Ok(()) => (inflight.memo.on_ok)(),
                Err(e) => (inflight.memo.on_reject)(e),
            }
        }
        self.dequeue_and_send(peer, now);
    }

    /// Cancel the in-flight or queued write to `peer`, if any. A queued
    /// memo is rejected immediately with [`Error::Cancelled`]; an
    /// in-flight one is only rejected once the real reply arrives or
    /// the timeout elapses, and no further traffic is sent on its
    /// behalf.
    pub fn cancel(&mut self, peer: NodeID) {
        if let Some(inflight) = self.inflight.get_mut(&peer) {
            inflight.cancelled = true;
        }
        // Queued-but-not-yet-sent memos: cancel the whole queue for this
        // peer (callers needing finer-grained cancellation track memos
        // themselves before submission).
        if let Some(queue) = self.queues.remove(&peer) {
            for memo in queue {
                (memo.on_reject)(Error::Cancelled);
            }
        }
    }

    /// Handle an inbound message that has already been translated by
    /// the link layer. Non-datagram MTIs are ignored.
    pub fn deliver_message(&mut self, msg: Message, now: Instant) {
        match msg.mti {
            MTI::Datagram => self.handle_inbound_datagram(msg),
            MTI::DatagramReceivedOk => self.complete(msg.source, now, Ok(())),
            MTI::DatagramRejected => {
                let code = read_u16_be(&msg.data);
                self.complete(msg.source, now, Err(Error::DatagramRejected { code }));
            }
            _ => {}
        }
    }

    fn handle_inbound_datagram(&mut self, msg: Message) {
        let peer = msg.source;
        let mut handled = false;
        let mut failed = false;
        for listener in &mut self.receive_listeners {
            match listener(peer, &msg.data) {
                Ok(true) => {
                    handled = true;
                    break;
                }
                Ok(false) => continue,
                Err(reason) => {
                    warn!("datagram: receive listener failed for {peer}: {reason}");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            let reply = Message::addressed(
                MTI::DatagramRejected,
                self.local,
                peer,
                PERMANENT_ERROR_CODE.to_be_bytes().to_vec(),
            );
            self.send(reply);
        } else if !handled {
            let reply = Message::addressed(MTI::DatagramReceivedOk, self.local, peer, vec![]);
            self.send(reply);
        }
    }

    /// Advance timers: any in-flight write past its deadline is
    /// completed with [`Error::DatagramTimeout`].
    pub fn tick(&mut self, now: Instant) {
        let expired: Vec<NodeID> = self
            .inflight
            .iter()
            .filter(|(_, f)| now >= f.deadline)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired {
            debug!("datagram: timeout waiting for reply from {peer}");
            self.complete(peer, now, Err(Error::DatagramTimeout));
        }
    }

    /// Whether a write is currently in flight to `peer`.
    pub fn in_flight(&self, peer: NodeID) -> bool {
        self.inflight.contains_key(&peer)
    }
}

/// Reason code used when a receive listener raises while handling an
/// inbound datagram (spec.md §4.3's "rejected with PermanentError").
const PERMANENT_ERROR_CODE: u16 = 0x1000;

fn read_u16_be(data: &[u8]) -> u16 {
    match data {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn node(s: &str) -> NodeID {
        NodeID::from_dotted(s).unwrap()
    }

    #[test]
    fn single_write_ok() {
        let local = node("05.01.01.01.03.01");
        let peer = node("02.01.57.00.04.9C");
        let mut svc = DatagramService::new(local);
        let sent = Rc::new(RefCell::new(Vec::new()));
        let s2 = sent.clone();
        svc.on_message_out(move |m| s2.borrow_mut().push(m));

        let ok = Rc::new(RefCell::new(false));
        let ok2 = ok.clone();
        let now = Instant::now();
        let memo = DatagramWriteMemo::new(peer, vec![1, 2, 3], move || *ok2.borrow_mut() = true, |_| {}).unwrap();
        svc.submit_write(memo, now);
        assert_eq!(sent.borrow().len(), 1);
        assert!(svc.in_flight(peer));

        svc.deliver_message(Message::addressed(MTI::DatagramReceivedOk, peer, local, vec![]), now);
        assert!(*ok.borrow());
        assert!(!svc.in_flight(peer));
    }

    #[test]
    fn queued_writes_are_fifo_per_peer_s2() {
        let local = node("05.01.01.01.03.01");
        let peer = node("02.01.57.00.04.9C");
        let mut svc = DatagramService::new(local);
        let sent = Rc::new(RefCell::new(Vec::new()));
        let s2 = sent.clone();
        svc.on_message_out(move |m| s2.borrow_mut().push(m));

        let order = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();
        for i in 0..3 {
            let o = order.clone();
            let memo = DatagramWriteMemo::new(peer, vec![i], move || o.borrow_mut().push(i), |_| {}).unwrap();
            svc.submit_write(memo, now);
        }
        // Only the first memo's datagram has gone out so far.
        assert_eq!(sent.borrow().len(), 1);

        for _ in 0..3 {
            svc.deliver_message(Message::addressed(MTI::DatagramReceivedOk, peer, local, vec![]), now);
        }
        assert_eq!(sent.borrow().len(), 3);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn interleaved_submissions_stay_fifo_per_peer() {
        let local = node("05.01.01.01.03.01");
        let peer_a = node("02.01.57.00.04.9C");
        let peer_b = node("02.01.57.00.04.9D");
        let mut svc = DatagramService::new(local);
        let sent = Rc::new(RefCell::new(Vec::new()));
        let s2 = sent.clone();
        svc.on_message_out(move |m| s2.borrow_mut().push(m));

        let order_a = Rc::new(RefCell::new(Vec::new()));
        let order_b = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        // Interleave submissions to two peers: A0, B0, A1, B1, A2, B2.
        for i in 0..3 {
            let oa = order_a.clone();
            let memo_a = DatagramWriteMemo::new(peer_a, vec![i], move || oa.borrow_mut().push(i), |_| {}).unwrap();
            svc.submit_write(memo_a, now);

            let ob = order_b.clone();
            let memo_b = DatagramWriteMemo::new(peer_b, vec![i], move || ob.borrow_mut().push(i), |_| {}).unwrap();
            svc.submit_write(memo_b, now);
        }

        // Each peer has exactly one in-flight datagram: the first memo
        // submitted to it, regardless of the other peer's submissions.
        assert_eq!(sent.borrow().len(), 2);
        assert!(svc.in_flight(peer_a));
        assert!(svc.in_flight(peer_b));

        // Resolve peer B's queue first; peer A must stay untouched,
        // still holding only its own first reply in flight.
        for _ in 0..3 {
            svc.deliver_message(Message::addressed(MTI::DatagramReceivedOk, peer_b, local, vec![]), now);
        }
        assert_eq!(*order_b.borrow(), vec![0, 1, 2]);
        assert!(order_a.borrow().is_empty());
        assert!(!svc.in_flight(peer_b));
        assert!(svc.in_flight(peer_a));

        for _ in 0..3 {
            svc.deliver_message(Message::addressed(MTI::DatagramReceivedOk, peer_a, local, vec![]), now);
        }
        assert_eq!(*order_a.borrow(), vec![0, 1, 2]);
        assert!(!svc.in_flight(peer_a));
        assert_eq!(sent.borrow().len(), 6);
    }

    #[test]
    fn reject_carries_code_s3() {
        let local = node("05.01.01.01.03.01");
        let peer = node("02.01.57.00.04.9C");
        let mut svc = DatagramService::new(local);
        svc.on_message_out(|_| {});
        let got = Rc::new(RefCell::new(None));
        let g2 = got.clone();
        let now = Instant::now();
        let memo = DatagramWriteMemo::new(peer, vec![0xAA], || {}, move |e| *g2.borrow_mut() = Some(e)).unwrap();
        svc.submit_write(memo, now);
        svc.deliver_message(
            Message::addressed(MTI::DatagramRejected, peer, local, 0x1000u16.to_be_bytes().to_vec()),
            now,
        );
        match got.borrow().as_ref().unwrap() {
            Error::DatagramRejected { code } => assert_eq!(*code, 0x1000),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn timeout_without_reply() {
        let local = node("05.01.01.01.03.01");
        let peer = node("02.01.57.00.04.9C");
        let mut svc = DatagramService::new(local);
        svc.set_timeout(Duration::from_millis(10));
        svc.on_message_out(|_| {});
        let got = Rc::new(RefCell::new(None));
        let g2 = got.clone();
        let now = Instant::now();
        let memo = DatagramWriteMemo::new(peer, vec![0], || {}, move |e| *g2.borrow_mut() = Some(e)).unwrap();
        svc.submit_write(memo, now);
        svc.tick(now + Duration::from_millis(11));
        assert!(matches!(got.borrow().as_ref().unwrap(), Error::DatagramTimeout));
    }

    #[test]
    fn receive_dispatch_auto_acks_when_no_listener_handles() {
        let local = node("05.01.01.01.03.01");
        let peer = node("02.01.57.00.04.9C");
        let mut svc = DatagramService::new(local);
        let sent = Rc::new(RefCell::new(Vec::new()));
        let s2 = sent.clone();
        svc.on_message_out(move |m| s2.borrow_mut().push(m));
        svc.on_receive(|_, _| Ok(false));
        svc.deliver_message(Message::addressed(MTI::Datagram, peer, local, vec![1]), Instant::now());
        assert_eq!(sent.borrow().len(), 1);
        assert_eq!(sent.borrow()[0].mti, MTI::DatagramReceivedOk);
    }

    #[test]
    fn receive_listener_error_rejects_with_permanent_error() {
        let local = node("05.01.01.01.03.01");
        let peer = node("02.01.57.00.04.9C");
        let mut svc = DatagramService::new(local);
        let sent = Rc::new(RefCell::new(Vec::new()));
        let s2 = sent.clone();
        svc.on_message_out(move |m| s2.borrow_mut().push(m));
        svc.on_receive(|_, _| Err("boom".into()));
        svc.deliver_message(Message::addressed(MTI::Datagram, peer, local, vec![1]), Instant::now());
        assert_eq!(sent.borrow()[0].mti, MTI::DatagramRejected);
    }

    #[test]
    fn cancel_queued_memo_rejects_immediately() {
        let local = node("05.01.01.01.03.01");
        let peer = node("02.01.57.00.04.9C");
        let mut svc = DatagramService::new(local);
        svc.on_message_out(|_| {});
        let now = Instant::now();
        let first = DatagramWriteMemo::new(peer, vec![0], || {}, |_| {}).unwrap();
        svc.submit_write(first, now);
        let cancelled = Rc::new(RefCell::new(false));
        let c2 = cancelled.clone();
        let second = DatagramWriteMemo::new(peer, vec![1], || {}, move |e| {
            assert!(matches!(e, Error::Cancelled));
            *c2.borrow_mut() = true;
        })
        .unwrap();
        svc.submit_write(second, now);
        svc.cancel(peer);
        assert!(*cancelled.borrow());
    }
}
