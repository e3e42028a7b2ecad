//! cowrite wire protocol
//!
//! JSON text frames, one message per frame, tagged by `type`.
//!
//! ## Client to server
//! ```text
//! {"type":"edit","baseRevision":3,"content":"Hello","clientSeq":7}
//! {"type":"heartbeat"}
//! ```
//!
//! ## Server to client
//! ```text
//! {"type":"attach_ack","revision":3,"content":"...","connectionToken":"...","color":"#61afef","heartbeatIntervalMs":15000}
//! {"type":"edit_ack","revision":4,"clientSeq":7}
//! {"type":"broadcast","revision":5,"content":"...","fromUser":"bob","overwrite":false}
//! {"type":"presence","users":[...]}
//! {"type":"rejected","clientSeq":8,"code":"MALFORMED_CONTENT","message":"..."}
//! {"type":"save_status","persistedRevision":5,"pending":false}
//! {"type":"heartbeat"}
//! ```

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{
    decode_client, decode_client_with_limit, decode_server, encode, frame_limit,
    recover_client_seq, FRAME_ENVELOPE_BYTES, MAX_FRAME_BYTES,
};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{ClientMessage, PresenceUser, ServerMessage};
