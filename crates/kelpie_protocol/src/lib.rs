//! Binary framing shared by the kelpie engine and daemon.
//!
//! The wire format is a fixed 24-byte header followed by extras, key and
//! value sections. Only the frames the core actually emits or consumes are
//! modelled here: server-initiated authentication traffic and the
//! seqno-acknowledgement sent by a replica vbucket.

mod frame;

pub use frame::{
    encode_seqno_ack, ClientOpcode, Datatype, FrameError, Magic, Request, RequestBuilder,
    Response, ServerOpcode, Status, HEADER_LEN,
};
