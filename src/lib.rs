#![warn(missing_docs)]
/*! An OpenLCB/LCC (Layout Command Control) node stack.

This crate is the CORE of a node that participates on an LCC network
over a CAN bus tunnelled through TCP using the GridConnect ASCII
framing. It is layered bottom-up:

```text
  [TCP transport]  <->  GridConnect codec  <->  CAN link layer
                                                     ^  v (messages)
                                           Datagram service
                                                     ^  v (datagram memos)
                                              Memory service
                                                     ^  v (read/write memos)
                                                Consumer (e.g. cdi::download)
```

Each layer exposes a narrow contract: something below it calls up
through a registered listener, and it calls down through a plain
function handed to it at construction time. No layer holds a reference
back to its caller, and no layer knows its caller's identity -- see
[`node`] for how they're composed without that coupling.

Everything above the transport boundary ([`transport`]) runs on a
single logical task: a received frame synchronously walks up through
[`link`], [`datagram`], and [`memory`]; an outbound call synchronously
walks back down. Timers (alias arbitration spacing, datagram reply
timeout) are deadlines checked by an explicit `tick(now)` on the owning
service, not spawned sleeps, so the whole stack -- short of the one
dedicated socket-reading thread in [`transport::IoThread`] -- never
blocks.

# Example

```
use std::time::Instant;
use lcc_node::node::Node;
use lcc_node::node_id::NodeID;

let id = NodeID::from_dotted("05.01.01.01.03.01").unwrap();
let mut node = Node::new(id);
node.physical_layer_up(Instant::now());
// Drain the CID1 frame the arbitration just queued, GridConnect-encoded.
let out = node.drain_outbound();
assert_eq!(out.len(), 1);
assert!(String::from_utf8(out[0].clone()).unwrap().starts_with(":X"));
```

# Scope

In scope: the GridConnect codec, CAN link layer (alias arbitration,
frame/message translation, multi-frame reassembly), the datagram
service, the memory-configuration service, a SNIP accumulator, and the
mDNS service-name convention. The CDI download loop ([`cdi`]) is
included as a composition example built entirely on the public memory
service surface.

Out of scope, by design: serving as a full LCC gateway, multi-link
routing, persistence of node state, every OpenLCB well-known event, and
any graphical configuration tooling. The CDI document itself (an XML
schema) is not parsed here; only the byte transfer that would carry one
is implemented.
*/

/// 48-bit node identity.
pub mod node_id;

/// Per-link alias table.
pub mod alias;

/// Error kinds shared across every layer.
pub mod error;

/// CAN frame representation and the MTI enumeration.
pub mod frame;

/// High-level, NodeID-addressed messages.
pub mod message;

/// GridConnect ASCII codec.
pub mod gridconnect;

/// CAN link layer: alias arbitration and frame/message translation.
pub mod link;

/// Reliable point-to-point datagram transfers.
pub mod datagram;

/// Memory-configuration protocol over the datagram service.
pub mod memory;

/// Simple Node Information Protocol accumulator.
pub mod snip;

/// mDNS service-name convention for LCC gateways.
pub mod mdns;

/// The transport boundary: a byte-stream socket to a CAN gateway.
pub mod transport;

/// Composes the link, datagram, and memory layers into one node.
pub mod node;

/// CDI download, a composition example built on the memory service.
pub mod cdi;

pub use error::Error;
pub use node_id::NodeID;
