use std::fmt;

use rmpv::Value;
use uuid::Uuid;

pub const NAME_RESPONSE: &str = "response";
pub const NAME_ERROR: &str = "error";
pub const NAME_PROGRESS: &str = "progress";
pub const NAME_RELOAD: &str = "reload";
pub const NAME_AUTH: &str = "auth";
pub const NAME_CONNECT: &str = "connect";
pub const NAME_EVT_ADD: &str = "evt:add";
pub const NAME_EVT_REMOVE: &str = "evt:remove";
pub const NAME_EVT_GETS: &str = "evt:gets";
pub const NAME_EVT_EMIT: &str = "evt:emit";
pub const NAME_EVT_ON: &str = "evt:on";

/// Error codes carried in the `code` field of an `error` frame body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    BadMessage,
    Unauthenticated,
    Unauthorized,
    InternalError,
    UpgradeRequired,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadMessage => "BAD_MESSAGE",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::UpgradeRequired => "UPGRADE_REQUIRED",
        }
    }
}

/// One logical protocol message. `uuid` correlates a request to the
/// response/error/progress frames replying to it; reply frames always echo
/// the request uuid. `body` is `Value::Nil` when the frame carries none.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub uuid: Uuid,
    pub name: String,
    pub body: Value,
}

#[derive(Debug, PartialEq)]
pub enum FrameError {
    NotAMap,
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    InvalidUuid { raw: String },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAMap => write!(f, "frame payload must be a map"),
            Self::MissingField { field } => write!(f, "missing frame field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid type for frame field '{field}', expected {expected}")
            }
            Self::InvalidUuid { raw } => write!(f, "frame uuid '{raw}' is not a valid UUID"),
        }
    }
}

impl std::error::Error for FrameError {}

impl Frame {
    pub fn new(uuid: Uuid, name: impl Into<String>, body: Value) -> Self {
        Self {
            uuid,
            name: name.into(),
            body,
        }
    }

    pub fn response(request_uuid: Uuid, body: Value) -> Self {
        Self::new(request_uuid, NAME_RESPONSE, body)
    }

    pub fn error(
        request_uuid: Uuid,
        code: ErrorCode,
        error_name: &str,
        message: &str,
        stack: Option<&str>,
    ) -> Self {
        let body = Value::Map(vec![
            (Value::from("name"), Value::from(error_name)),
            (Value::from("message"), Value::from(message)),
            (Value::from("stack"), Value::from(stack.unwrap_or(""))),
            (Value::from("code"), Value::from(code.as_str())),
        ]);
        Self::new(request_uuid, NAME_ERROR, body)
    }

    pub fn progress(request_uuid: Uuid, total_size: u64, completed_size: u64) -> Self {
        let body = Value::Map(vec![
            (Value::from("totalSize"), Value::from(total_size)),
            (Value::from("completedSize"), Value::from(completed_size)),
        ]);
        Self::new(request_uuid, NAME_PROGRESS, body)
    }

    /// Unsolicited fan-out frame carrying the matched listener keys owned
    /// by the receiving connection.
    pub fn evt_on(keys: Vec<String>, data: Value) -> Self {
        let body = Value::Map(vec![
            (
                Value::from("keys"),
                Value::Array(keys.into_iter().map(Value::from).collect()),
            ),
            (Value::from("data"), data),
        ]);
        Self::new(Uuid::new_v4(), NAME_EVT_ON, body)
    }

    pub fn reload(client_name: Option<&str>, changed_files: Vec<String>) -> Self {
        let mut entries = Vec::with_capacity(2);
        if let Some(name) = client_name {
            entries.push((Value::from("clientName"), Value::from(name)));
        }
        entries.push((
            Value::from("changedFileSet"),
            Value::Array(changed_files.into_iter().map(Value::from).collect()),
        ));
        Self::new(Uuid::new_v4(), NAME_RELOAD, Value::Map(entries))
    }

    pub fn into_value(self) -> Value {
        Value::Map(vec![
            (Value::from("uuid"), Value::from(self.uuid.to_string())),
            (Value::from("name"), Value::from(self.name)),
            (Value::from("body"), self.body),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Map(entries) = value else {
            return Err(FrameError::NotAMap);
        };

        let mut raw_uuid = None;
        let mut name = None;
        let mut body = Value::Nil;
        for (key, entry) in entries {
            let Some(key) = key.as_str() else {
                continue;
            };
            match key {
                "uuid" => {
                    let Value::String(text) = entry else {
                        return Err(FrameError::InvalidFieldType {
                            field: "uuid",
                            expected: "string",
                        });
                    };
                    let Some(text) = text.as_str() else {
                        return Err(FrameError::InvalidFieldType {
                            field: "uuid",
                            expected: "string",
                        });
                    };
                    raw_uuid = Some(text.to_owned());
                }
                "name" => {
                    let Value::String(text) = entry else {
                        return Err(FrameError::InvalidFieldType {
                            field: "name",
                            expected: "string",
                        });
                    };
                    let Some(text) = text.as_str() else {
                        return Err(FrameError::InvalidFieldType {
                            field: "name",
                            expected: "string",
                        });
                    };
                    name = Some(text.to_owned());
                }
                "body" => body = entry,
                _ => {}
            }
        }

        let raw_uuid = raw_uuid.ok_or(FrameError::MissingField { field: "uuid" })?;
        let uuid = Uuid::parse_str(&raw_uuid).map_err(|_| FrameError::InvalidUuid { raw: raw_uuid })?;
        let name = name.ok_or(FrameError::MissingField { field: "name" })?;

        Ok(Self { uuid, name, body })
    }

    /// Body as an argument list for RPC dispatch. `Nil` means no arguments.
    pub fn args(&self) -> Option<&[Value]> {
        match &self.body {
            Value::Nil => Some(&[]),
            Value::Array(values) => Some(values),
            _ => None,
        }
    }
}

/// Splits an RPC frame name into `(service, method)`. Control names and
/// anything without exactly one dot separating two non-empty halves are
/// rejected.
pub fn parse_rpc_name(name: &str) -> Option<(&str, &str)> {
    let mut parts = name.splitn(2, '.');
    let service = parts.next()?;
    let method = parts.next()?;
    if service.is_empty() || method.is_empty() || method.contains('.') {
        return None;
    }
    Some((service, method))
}

pub fn body_string(body: &Value, key: &str) -> Option<String> {
    let Value::Map(entries) = body else {
        return None;
    };
    entries
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .and_then(|(_, v)| v.as_str())
        .map(str::to_owned)
}

pub fn body_value<'a>(body: &'a Value, key: &str) -> Option<&'a Value> {
    let Value::Map(entries) = body else {
        return None;
    };
    entries
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}
