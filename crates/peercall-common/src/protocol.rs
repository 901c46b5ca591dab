//! Handshake messages exchanged between peers during call setup.
//!
//! Each message travels as a single line of JSON over the negotiation
//! connection. The initiator sends `CALL_OFFER`, the dialed peer answers with
//! exactly one `CALL_ACCEPT` or `CALL_REJECT`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Handshake protocol version carried in every offer.
pub const PROTOCOL_VERSION: u16 = 1;

/// Longest handshake line accepted from the network, newline included.
pub const MAX_HANDSHAKE_LINE: usize = 4096;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
#[allow(non_camel_case_types)]
pub enum HandshakeMessage {
    /// Call proposal from the negotiating peer.
    CALL_OFFER {
        version: u16,
        call_id: Uuid,
        /// Port the initiator listens on, so the callee can address it later.
        listen_port: u16,
    },

    /// The callee joins the call.
    CALL_ACCEPT { call_id: Uuid },

    /// The callee refuses the call.
    CALL_REJECT { call_id: Uuid, reason: String },
}

impl HandshakeMessage {
    pub fn call_id(&self) -> Uuid {
        match self {
            Self::CALL_OFFER { call_id, .. }
            | Self::CALL_ACCEPT { call_id }
            | Self::CALL_REJECT { call_id, .. } => *call_id,
        }
    }

    /// Encode as one newline-terminated JSON line.
    pub fn encode_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        if line.len() >= MAX_HANDSHAKE_LINE {
            return Err(Error::protocol(format!(
                "handshake message of {} bytes exceeds the line limit",
                line.len()
            )));
        }
        line.push('\n');
        Ok(line)
    }

    /// Decode one line (with or without its trailing newline).
    pub fn decode_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() >= MAX_HANDSHAKE_LINE {
            return Err(Error::protocol("handshake line too long"));
        }
        Ok(serde_json::from_str(line)?)
    }
}
