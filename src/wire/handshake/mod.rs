use rmpv::Value;

use crate::wire::frame::{self, Frame, NAME_CONNECT};

/// Wire protocol version spoken by this server. A `connect` frame must
/// claim exactly this version; anything else gets an upgrade-required
/// error and the socket closes.
pub const PROTOCOL_VERSION: u64 = 2;

/// The single RPC the legacy (unversioned) protocol may issue. Old
/// clients use it to fetch an update pointer before reconnecting with a
/// current protocol build.
pub const LEGACY_LAST_VERSION_CALL: &str = "Sys.lastVersion";

/// Classification of the first frame received on a fresh socket.
#[derive(Debug, PartialEq)]
pub enum HandshakeOutcome {
    /// A valid `connect`: register the connection under this identity.
    Establish {
        client_id: String,
        client_name: String,
    },
    /// A legacy client asking for the last version: reply, then close.
    LegacyVersionQuery,
    /// An unsupported version or any other legacy call: send an
    /// `UPGRADE_REQUIRED` error, then close.
    UpgradeRequired,
    /// A `connect` frame missing required fields: send a `BAD_MESSAGE`
    /// error, then close.
    BadConnect { reason: &'static str },
}

/// Decides what to do with the first frame on a not-yet-established
/// socket. Bytes that fail to decode into a frame at all never reach
/// here; the caller logs and drops those without a reply, since the
/// legacy wire format has no error channel.
pub fn evaluate_first_frame(first: &Frame) -> HandshakeOutcome {
    if first.name == NAME_CONNECT {
        return evaluate_connect(first);
    }

    if first.name == LEGACY_LAST_VERSION_CALL {
        return HandshakeOutcome::LegacyVersionQuery;
    }

    HandshakeOutcome::UpgradeRequired
}

fn evaluate_connect(first: &Frame) -> HandshakeOutcome {
    let version = frame::body_value(&first.body, "version").and_then(Value::as_u64);
    match version {
        Some(version) if version == PROTOCOL_VERSION => {}
        Some(_) => return HandshakeOutcome::UpgradeRequired,
        None => return HandshakeOutcome::UpgradeRequired,
    }

    let Some(client_id) = frame::body_string(&first.body, "clientId") else {
        return HandshakeOutcome::BadConnect {
            reason: "connect frame requires a string 'clientId'",
        };
    };
    if client_id.is_empty() {
        return HandshakeOutcome::BadConnect {
            reason: "connect 'clientId' cannot be empty",
        };
    }
    let Some(client_name) = frame::body_string(&first.body, "clientName") else {
        return HandshakeOutcome::BadConnect {
            reason: "connect frame requires a string 'clientName'",
        };
    };

    HandshakeOutcome::Establish {
        client_id,
        client_name,
    }
}

/// Reply for a legacy last-version query: echoes the request uuid so the
/// minimal legacy client can correlate it, body is the version string.
pub fn last_version_reply(request: &Frame, last_version: &str) -> Frame {
    Frame::response(request.uuid, Value::from(last_version))
}
