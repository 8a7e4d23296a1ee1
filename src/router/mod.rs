use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rmpv::Value;
use serde_json::json;

use crate::auth::{AuthError, TokenSigner};
use crate::connection::{Connection, ListenerRegistration};
use crate::logging::Logger;
use crate::registry::ConnectionRegistry;
use crate::services::{AccessDenied, CallContext, ResolveError, ServiceTable};
use crate::wire::frame::{
    self, parse_rpc_name, ErrorCode, Frame, NAME_AUTH, NAME_EVT_ADD, NAME_EVT_EMIT, NAME_EVT_GETS,
    NAME_EVT_REMOVE,
};

const LOG_CONTEXT: &str = "router";

/// Turns each decoded request frame into exactly one reply frame. Control
/// frames (`auth`, `evt:*`) are handled here; dotted names dispatch into
/// the service table. Fan-out frames triggered by `evt:emit` go out to
/// other connections as a side effect, never as the caller's reply.
pub struct Router {
    services: Arc<ServiceTable>,
    registry: Arc<ConnectionRegistry>,
    signer: Option<TokenSigner>,
    logger: Arc<Logger>,
}

impl Router {
    pub fn new(
        services: Arc<ServiceTable>,
        registry: Arc<ConnectionRegistry>,
        signer: Option<TokenSigner>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            services,
            registry,
            signer,
            logger,
        }
    }

    pub fn handle_frame(&self, connection: &Arc<Connection>, request: &Frame) -> Frame {
        match request.name.as_str() {
            NAME_AUTH => self.handle_auth(connection, request),
            NAME_EVT_ADD => self.handle_evt_add(connection, request),
            NAME_EVT_REMOVE => self.handle_evt_remove(connection, request),
            NAME_EVT_GETS => self.handle_evt_gets(request),
            NAME_EVT_EMIT => self.handle_evt_emit(connection, request),
            name => match parse_rpc_name(name) {
                Some((service, method)) => self.dispatch(connection, request, service, method),
                None => Frame::error(
                    request.uuid,
                    ErrorCode::BadMessage,
                    "Error",
                    &format!("'{name}' is not a valid call name"),
                    None,
                ),
            },
        }
    }

    fn handle_auth(&self, connection: &Arc<Connection>, request: &Frame) -> Frame {
        let Some(signer) = &self.signer else {
            return Frame::error(
                request.uuid,
                ErrorCode::InternalError,
                "Error",
                "authentication is not configured on this server",
                None,
            );
        };

        let Some(token) = extract_token(&request.body) else {
            return Frame::error(
                request.uuid,
                ErrorCode::BadMessage,
                "Error",
                "auth frame carries no token",
                None,
            );
        };

        match signer.verify(&token) {
            Ok(payload) => {
                self.logger.debug(
                    Some(LOG_CONTEXT),
                    &format!(
                        "client '{}' authenticated with roles {:?}",
                        connection.client_id(),
                        payload.roles
                    ),
                );
                connection.set_auth(payload);
                Frame::response(request.uuid, Value::Boolean(true))
            }
            Err(AuthError::Expired) => Frame::error(
                request.uuid,
                ErrorCode::Unauthenticated,
                "TokenExpired",
                "auth token has expired",
                None,
            ),
            Err(error) => Frame::error(
                request.uuid,
                ErrorCode::Unauthenticated,
                "TokenInvalid",
                &error.to_string(),
                None,
            ),
        }
    }

    /// `evt:add` body: `{key, name, info?}`.
    fn handle_evt_add(&self, connection: &Arc<Connection>, request: &Frame) -> Frame {
        let key = frame::body_string(&request.body, "key");
        let event_name = frame::body_string(&request.body, "name");
        let (Some(key), Some(event_name)) = (key, event_name) else {
            return Frame::error(
                request.uuid,
                ErrorCode::BadMessage,
                "Error",
                "evt:add requires string 'key' and 'name' fields",
                None,
            );
        };
        let info = frame::body_value(&request.body, "info")
            .cloned()
            .unwrap_or(Value::Nil);

        connection.add_listener(ListenerRegistration {
            key,
            event_name,
            info,
        });
        Frame::response(request.uuid, Value::Boolean(true))
    }

    /// `evt:remove` body: `{key}`.
    fn handle_evt_remove(&self, connection: &Arc<Connection>, request: &Frame) -> Frame {
        let Some(key) = frame::body_string(&request.body, "key") else {
            return Frame::error(
                request.uuid,
                ErrorCode::BadMessage,
                "Error",
                "evt:remove requires a string 'key' field",
                None,
            );
        };
        let removed = connection.remove_listener(&key);
        Frame::response(request.uuid, Value::Boolean(removed))
    }

    /// `evt:gets` body: `{name}`; reply body: `[{key, info}]` collected
    /// across all live connections.
    fn handle_evt_gets(&self, request: &Frame) -> Frame {
        let Some(event_name) = frame::body_string(&request.body, "name") else {
            return Frame::error(
                request.uuid,
                ErrorCode::BadMessage,
                "Error",
                "evt:gets requires a string 'name' field",
                None,
            );
        };

        let entries: Vec<Value> = self
            .registry
            .listener_registrations(&event_name)
            .into_iter()
            .map(|registration| {
                Value::Map(vec![
                    (Value::from("key"), Value::from(registration.key)),
                    (Value::from("info"), registration.info),
                ])
            })
            .collect();
        Frame::response(request.uuid, Value::Array(entries))
    }

    fn handle_evt_emit(&self, connection: &Arc<Connection>, request: &Frame) -> Frame {
        let keys = frame::body_value(&request.body, "keys").and_then(value_as_keys);
        let Some(keys) = keys else {
            return Frame::error(
                request.uuid,
                ErrorCode::BadMessage,
                "Error",
                "evt:emit requires a non-empty string 'keys' array",
                None,
            );
        };
        let data = frame::body_value(&request.body, "data")
            .cloned()
            .unwrap_or(Value::Nil);

        let delivered = self.registry.emit_keys(&keys, &data);
        self.logger.verbose(
            Some(LOG_CONTEXT),
            &format!(
                "client '{}' emitted {:?} to {delivered} listener connection(s)",
                connection.client_id(),
                keys
            ),
        );
        Frame::response(request.uuid, Value::from(delivered as u64))
    }

    fn dispatch(
        &self,
        connection: &Arc<Connection>,
        request: &Frame,
        service: &str,
        method: &str,
    ) -> Frame {
        // clientName scopes authorization decisions; traversal characters
        // in it are a hard request error, never a crash.
        let client_name = connection.client_name();
        if client_name.contains("..") || client_name.contains('/') || client_name.contains('\\') {
            return Frame::error(
                request.uuid,
                ErrorCode::BadMessage,
                "Error",
                &format!("client name '{client_name}' contains path traversal characters"),
                None,
            );
        }

        let resolved = match self.services.resolve(service, method) {
            Ok(resolved) => resolved,
            Err(error @ ResolveError::ServiceNotFound { .. })
            | Err(error @ ResolveError::MethodNotFound { .. }) => {
                return Frame::error(
                    request.uuid,
                    ErrorCode::BadMessage,
                    "Error",
                    &error.to_string(),
                    None,
                );
            }
        };

        if let Err(denied) = resolved.permission.check(connection) {
            let (code, message) = match denied {
                AccessDenied::Unauthenticated => (
                    ErrorCode::Unauthenticated,
                    format!("'{service}.{method}' requires authentication"),
                ),
                AccessDenied::Unauthorized => (
                    ErrorCode::Unauthorized,
                    format!(
                        "client '{}' lacks a role required by '{service}.{method}'",
                        connection.client_id()
                    ),
                ),
            };
            return Frame::error(request.uuid, code, "Error", &message, None);
        }

        let Some(args) = request.args() else {
            return Frame::error(
                request.uuid,
                ErrorCode::BadMessage,
                "Error",
                "call body must be an argument array or empty",
                None,
            );
        };

        let context = CallContext {
            registry: &self.registry,
            connection,
            args,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| (resolved.handler)(&context)));
        match outcome {
            Ok(Ok(result)) => Frame::response(request.uuid, result),
            Ok(Err(error)) => {
                self.logger.log(
                    crate::logging::LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    &format!("handler '{service}.{method}' failed"),
                    Some(json!({"error": error.message, "clientId": connection.client_id()})),
                );
                Frame::error(
                    request.uuid,
                    ErrorCode::InternalError,
                    &error.name,
                    &error.message,
                    None,
                )
            }
            Err(_) => {
                self.logger.error(
                    Some(LOG_CONTEXT),
                    &format!("handler '{service}.{method}' panicked"),
                );
                Frame::error(
                    request.uuid,
                    ErrorCode::InternalError,
                    "Error",
                    &format!("'{service}.{method}' terminated unexpectedly"),
                    None,
                )
            }
        }
    }
}

/// Token from an auth frame body: a bare string, a one-element argument
/// array, or a `{token}` map.
fn extract_token(body: &Value) -> Option<String> {
    if let Some(token) = body.as_str() {
        return Some(token.to_owned());
    }
    if let Value::Array(values) = body {
        return values.first().and_then(Value::as_str).map(str::to_owned);
    }
    frame::body_string(body, "token")
}

fn value_as_keys(value: &Value) -> Option<Vec<String>> {
    let Value::Array(values) = value else {
        return None;
    };
    if values.is_empty() {
        return None;
    }
    values
        .iter()
        .map(|entry| entry.as_str().map(str::to_owned))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rmpv::Value;
    use uuid::Uuid;

    use crate::auth::TokenSigner;
    use crate::connection::test_support::socket_pair;
    use crate::connection::Connection;
    use crate::events::EventEmitter;
    use crate::logging::{Logger, LoggerConfig};
    use crate::registry::ConnectionRegistry;
    use crate::services::{Permission, ServiceDefinition, ServiceError, ServiceTable};
    use crate::wire::codec::CodecLimits;
    use crate::wire::frame::{self, Frame};

    use super::Router;

    struct Fixture {
        router: Router,
        registry: Arc<ConnectionRegistry>,
        signer: TokenSigner,
    }

    fn fixture() -> Fixture {
        let services = Arc::new(ServiceTable::new());
        services.register(
            ServiceDefinition::new("Echo")
                .permission(Permission::Open)
                .method("echo", |ctx| {
                    let text = ctx.args.first().and_then(Value::as_str).unwrap_or_default();
                    Ok(Value::from(format!("Echo: {text}")))
                })
                .method("fail", |_ctx| {
                    Err(ServiceError::new("EchoFailure", "echo broke"))
                })
                .method("explode", |_ctx| panic!("boom")),
        );
        services.register(
            ServiceDefinition::new("Reports")
                .permission(Permission::Roles(vec!["admin".to_owned()]))
                .method("restricted", |_ctx| Ok(Value::from("secret numbers")))
                .method_with_permission("public_summary", Permission::Open, |_ctx| {
                    Ok(Value::from("headline"))
                }),
        );
        services.register(
            ServiceDefinition::new("Profile")
                .permission(Permission::LoginRequired)
                .method("me", |_ctx| Ok(Value::from("profile"))),
        );

        let registry = Arc::new(ConnectionRegistry::new(Arc::new(EventEmitter::new())));
        let signer = TokenSigner::new("router-test-secret", 12).expect("signer should build");
        let router = Router::new(
            services,
            Arc::clone(&registry),
            Some(signer.clone()),
            Arc::new(Logger::new(LoggerConfig::default())),
        );
        Fixture {
            router,
            registry,
            signer,
        }
    }

    fn connection(client_id: &str) -> (Arc<Connection>, std::net::TcpStream) {
        let (socket, peer) = socket_pair();
        (
            Arc::new(Connection::new(socket, client_id, "ui", CodecLimits::default())),
            peer,
        )
    }

    fn request(name: &str, body: Value) -> Frame {
        Frame::new(Uuid::new_v4(), name, body)
    }

    fn error_code(reply: &Frame) -> String {
        frame::body_string(&reply.body, "code").expect("error body should carry a code")
    }

    #[test]
    fn echo_round_trip_returns_prefixed_text() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let req = request("Echo.echo", Value::Array(vec![Value::from("hi")]));
        let reply = fixture.router.handle_frame(&connection, &req);

        assert_eq!(reply.uuid, req.uuid);
        assert_eq!(reply.name, "response");
        assert_eq!(reply.body.as_str(), Some("Echo: hi"));
    }

    #[test]
    fn undotted_name_is_a_bad_message() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let reply = fixture
            .router
            .handle_frame(&connection, &request("NoDot", Value::Nil));
        assert_eq!(reply.name, "error");
        assert_eq!(error_code(&reply), "BAD_MESSAGE");
    }

    #[test]
    fn unknown_service_and_method_are_bad_messages() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let reply = fixture
            .router
            .handle_frame(&connection, &request("Missing.call", Value::Nil));
        assert_eq!(error_code(&reply), "BAD_MESSAGE");

        let reply = fixture
            .router
            .handle_frame(&connection, &request("Echo.missing", Value::Nil));
        assert_eq!(error_code(&reply), "BAD_MESSAGE");
    }

    #[test]
    fn login_required_service_rejects_anonymous_caller() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let reply = fixture
            .router
            .handle_frame(&connection, &request("Profile.me", Value::Nil));
        assert_eq!(error_code(&reply), "UNAUTHENTICATED");
    }

    #[test]
    fn role_gate_returns_unauthorized_for_wrong_role() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let token = fixture
            .signer
            .generate(vec!["viewer".to_owned()], serde_json::Value::Null);
        let auth_reply = fixture
            .router
            .handle_frame(&connection, &request("auth", Value::from(token)));
        assert_eq!(auth_reply.name, "response");
        assert_eq!(auth_reply.body, Value::Boolean(true));

        let reply = fixture
            .router
            .handle_frame(&connection, &request("Reports.restricted", Value::Nil));
        assert_eq!(error_code(&reply), "UNAUTHORIZED");
    }

    #[test]
    fn admin_role_passes_role_gate() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let token = fixture
            .signer
            .generate(vec!["admin".to_owned()], serde_json::Value::Null);
        fixture
            .router
            .handle_frame(&connection, &request("auth", Value::from(token)));

        let reply = fixture
            .router
            .handle_frame(&connection, &request("Reports.restricted", Value::Nil));
        assert_eq!(reply.name, "response");
        assert_eq!(reply.body.as_str(), Some("secret numbers"));
    }

    #[test]
    fn open_method_override_bypasses_class_role_gate() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let reply = fixture
            .router
            .handle_frame(&connection, &request("Reports.public_summary", Value::Nil));
        assert_eq!(reply.name, "response");
        assert_eq!(reply.body.as_str(), Some("headline"));
    }

    #[test]
    fn expired_token_reports_token_expired() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let stale = crate::auth::AuthTokenPayload {
            roles: vec![],
            data: serde_json::Value::Null,
            issued_at: chrono::Utc::now().timestamp() - 7200,
            expires_at: chrono::Utc::now().timestamp() - 3600,
        };
        let token = fixture.signer.sign(&stale);
        let reply = fixture
            .router
            .handle_frame(&connection, &request("auth", Value::from(token)));

        assert_eq!(error_code(&reply), "UNAUTHENTICATED");
        assert_eq!(
            frame::body_string(&reply.body, "name").as_deref(),
            Some("TokenExpired")
        );
        assert!(!connection.is_authenticated());
    }

    #[test]
    fn forged_token_reports_token_invalid() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let other_signer = TokenSigner::new("other-secret", 12).expect("signer should build");
        let token = other_signer.generate(vec!["admin".to_owned()], serde_json::Value::Null);
        let reply = fixture
            .router
            .handle_frame(&connection, &request("auth", Value::from(token)));

        assert_eq!(error_code(&reply), "UNAUTHENTICATED");
        assert_eq!(
            frame::body_string(&reply.body, "name").as_deref(),
            Some("TokenInvalid")
        );
    }

    #[test]
    fn handler_error_maps_to_internal_error_with_name() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let reply = fixture
            .router
            .handle_frame(&connection, &request("Echo.fail", Value::Nil));
        assert_eq!(error_code(&reply), "INTERNAL_ERROR");
        assert_eq!(
            frame::body_string(&reply.body, "name").as_deref(),
            Some("EchoFailure")
        );
        assert_eq!(
            frame::body_string(&reply.body, "message").as_deref(),
            Some("echo broke")
        );
    }

    #[test]
    fn handler_panic_is_contained_and_reported() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let reply = fixture
            .router
            .handle_frame(&connection, &request("Echo.explode", Value::Nil));
        assert_eq!(error_code(&reply), "INTERNAL_ERROR");

        // The connection survives a panicking handler.
        let reply = fixture.router.handle_frame(
            &connection,
            &request("Echo.echo", Value::Array(vec![Value::from("still here")])),
        );
        assert_eq!(reply.body.as_str(), Some("Echo: still here"));
    }

    fn evt_add_body(key: &str, name: &str, info: Value) -> Value {
        Value::Map(vec![
            (Value::from("key"), Value::from(key)),
            (Value::from("name"), Value::from(name)),
            (Value::from("info"), info),
        ])
    }

    #[test]
    fn evt_add_gets_and_emit_cover_three_connections() {
        let fixture = fixture();
        let (caller, _caller_peer) = connection("caller");
        let (orders_conn, _orders_peer) = connection("orders-client");
        let (idle_conn, _idle_peer) = connection("idle-client");
        fixture.registry.add(Arc::clone(&caller));
        fixture.registry.add(Arc::clone(&orders_conn));
        fixture.registry.add(Arc::clone(&idle_conn));

        let reply = fixture.router.handle_frame(
            &orders_conn,
            &request(
                "evt:add",
                evt_add_body("k-orders", "orders.updated", Value::from("eu")),
            ),
        );
        assert_eq!(reply.body, Value::Boolean(true));

        let gets_reply = fixture.router.handle_frame(
            &caller,
            &request(
                "evt:gets",
                Value::Map(vec![(Value::from("name"), Value::from("orders.updated"))]),
            ),
        );
        let Value::Array(entries) = &gets_reply.body else {
            panic!("evt:gets reply should be an array");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(
            frame::body_string(&entries[0], "key").as_deref(),
            Some("k-orders")
        );

        let emit_reply = fixture.router.handle_frame(
            &caller,
            &request(
                "evt:emit",
                Value::Map(vec![
                    (
                        Value::from("keys"),
                        Value::Array(vec![Value::from("k-orders")]),
                    ),
                    (Value::from("data"), Value::from("order 7 shipped")),
                ]),
            ),
        );
        assert_eq!(emit_reply.body, Value::from(1_u64));

        let remove_reply = fixture.router.handle_frame(
            &orders_conn,
            &request(
                "evt:remove",
                Value::Map(vec![(Value::from("key"), Value::from("k-orders"))]),
            ),
        );
        assert_eq!(remove_reply.body, Value::Boolean(true));
        let emit_reply = fixture.router.handle_frame(
            &caller,
            &request(
                "evt:emit",
                Value::Map(vec![(
                    Value::from("keys"),
                    Value::Array(vec![Value::from("k-orders")]),
                )]),
            ),
        );
        assert_eq!(emit_reply.body, Value::from(0_u64));
    }

    #[test]
    fn evt_add_without_key_or_name_is_a_bad_message() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let reply = fixture.router.handle_frame(
            &connection,
            &request(
                "evt:add",
                Value::Map(vec![(Value::from("key"), Value::from("k1"))]),
            ),
        );
        assert_eq!(error_code(&reply), "BAD_MESSAGE");

        let reply = fixture
            .router
            .handle_frame(&connection, &request("evt:emit", Value::Array(vec![])));
        assert_eq!(error_code(&reply), "BAD_MESSAGE");
    }

    #[test]
    fn traversal_characters_in_client_name_are_a_bad_message() {
        let fixture = fixture();
        let (socket, _peer) = crate::connection::test_support::socket_pair();
        let connection = Arc::new(Connection::new(
            socket,
            "web-1",
            "../escape",
            CodecLimits::default(),
        ));

        let reply = fixture.router.handle_frame(
            &connection,
            &request("Echo.echo", Value::Array(vec![Value::from("hi")])),
        );
        assert_eq!(error_code(&reply), "BAD_MESSAGE");
    }

    #[test]
    fn scalar_call_body_is_a_bad_message() {
        let fixture = fixture();
        let (connection, _peer) = connection("web-1");

        let reply = fixture
            .router
            .handle_frame(&connection, &request("Echo.echo", Value::from(7)));
        assert_eq!(error_code(&reply), "BAD_MESSAGE");
    }
}
