//! Provider-bound frame construction.
//!
//! Each helper builds one server-initiated request ready to inject onto the
//! provider connection's outbound stream.

use base64::Engine;
use bytes::Bytes;
use kelpie_protocol::{Datatype, RequestBuilder, ServerOpcode};
use serde_json::json;

pub(super) fn authenticate_frame(
    opaque: u32,
    mechanism: &str,
    challenge: &[u8],
    authenticate_only: bool,
) -> Bytes {
    let payload = json!({
        "mechanism": mechanism,
        "challenge": base64::engine::general_purpose::STANDARD.encode(challenge),
        "authentication-only": authenticate_only,
    })
    .to_string();
    RequestBuilder::server_request(ServerOpcode::Authenticate)
        .datatype(Datatype::Json)
        .opaque(opaque)
        .value(payload.as_bytes())
        .build()
}

pub(super) fn get_authorization_frame(opaque: u32, username: &str) -> Bytes {
    RequestBuilder::server_request(ServerOpcode::GetAuthorization)
        .opaque(opaque)
        .key(username.as_bytes())
        .build()
}

pub(super) fn active_users_frame(payload: &str) -> Bytes {
    RequestBuilder::server_request(ServerOpcode::ActiveExternalUsers)
        .datatype(Datatype::Json)
        .value(payload.as_bytes())
        .build()
}
