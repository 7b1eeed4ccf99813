/*! High-level OpenLCB message, addressed only by [`NodeID`].

Messages never carry an alias: the CAN link layer is the sole place
translation between alias and NodeID happens, in both directions.
*/
use crate::frame::MTI;
use crate::node_id::NodeID;

/// A reassembled or about-to-be-fragmented OpenLCB message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type.
    pub mti: MTI,
    /// Sending node.
    pub source: NodeID,
    /// Destination node, if this is an addressed MTI.
    pub destination: Option<NodeID>,
    /// Payload bytes (may be empty).
    pub data: Vec<u8>,
}

impl Message {
    /// Build a global (no destination) message.
    pub fn global(mti: MTI, source: NodeID, data: Vec<u8>) -> Self {
        Self {
            mti,
            source,
            destination: None,
            data,
        }
    }

    /// Build an addressed message.
    pub fn addressed(mti: MTI, source: NodeID, destination: NodeID, data: Vec<u8>) -> Self {
        Self {
            mti,
            source,
            destination: Some(destination),
            data,
        }
    }
}
