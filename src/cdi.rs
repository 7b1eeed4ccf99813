/*! CDI download: read a peer's Config Description Information out of
the CDI memory space, one chunk at a time, per spec.md §4.7.

[`CdiDownload`] is a small state machine rather than a self-resubmitting
closure: a `MemoryReadMemo`'s `on_ok`/`on_fail` cannot reach back into
the `MemoryService` that owns it without the cyclic-ownership problem
spec.md §9 calls out, so the callbacks here only drop their outcome
into a shared slot (the same `Rc<RefCell<..>>` handoff
[`crate::memory::MemoryService`] itself uses internally) and
[`CdiDownload::step`] — driven by the caller once per event-loop pass —
is what actually issues the next read.
*/
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use log::warn;

use crate::datagram::DatagramService;
use crate::error::Error;
use crate::memory::{MAX_CHUNK_SHORT, MemoryReadMemo, MemoryService, Space};
use crate::node_id::NodeID;

type ChunkOutcome = Rc<RefCell<Option<Result<Vec<u8>, Error>>>>;

/// Drives a full CDI download from one peer.
pub struct CdiDownload {
    peer: NodeID,
    address: u32,
    collected: Vec<u8>,
    chunk_size: usize,
    outcome: ChunkOutcome,
    in_flight: bool,
    finished: bool,
}

impl CdiDownload {
    /// Start a new download from `peer`, beginning at address 0.
    pub fn new(peer: NodeID) -> Self {
        Self {
            peer,
            address: 0,
            collected: Vec::new(),
            chunk_size: MAX_CHUNK_SHORT,
            outcome: Rc::new(RefCell::new(None)),
            in_flight: false,
            finished: false,
        }
    }

    /// Whether the download has completed (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Advance the download by one step: issue the next chunk read if
    /// none is outstanding, or consume the previous chunk's result if
    /// one has arrived. Returns `Some(bytes)` once the transfer is
    /// complete — ended by a chunk shorter than requested or one
    /// containing a NUL, per spec.md §4.7.
    pub fn step(&mut self, mem: &mut MemoryService, datagram: &mut DatagramService, now: Instant) -> Option<Vec<u8>> {
        if self.finished {
            return None;
        }
        if !self.in_flight {
            self.issue_read(mem, datagram, now);
            return None;
        }
        let outcome = self.outcome.borrow_mut().take();
        match outcome {
            None => None,
            Some(Err(e)) => {
                warn!("cdi: download from {} failed at address {}: {e}", self.peer, self.address);
                self.finished = true;
                None
            }
            Some(Ok(data)) => {
                let ends_transfer = data.len() < self.chunk_size || data.contains(&0);
                let take = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                self.collected.extend_from_slice(&data[..take]);
                if ends_transfer {
                    self.finished = true;
                    Some(std::mem::take(&mut self.collected))
                } else {
                    self.address += data.len() as u32;
                    self.in_flight = false;
                    None
                }
            }
        }
    }

    fn issue_read(&mut self, mem: &mut MemoryService, datagram: &mut DatagramService, now: Instant) {
        self.in_flight = true;
        let ok_slot = self.outcome.clone();
        let fail_slot = self.outcome.clone();
        let memo = MemoryReadMemo {
            peer: self.peer,
            size: self.chunk_size as u8,
            space: Space::Cdi,
            address: self.address,
            on_ok: Box::new(move |data| *ok_slot.borrow_mut() = Some(Ok(data))),
            on_fail: Box::new(move |e| *fail_slot.borrow_mut() = Some(Err(e))),
        };
        mem.submit_read(memo, datagram, now);
    }
}
