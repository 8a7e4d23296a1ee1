use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rmpv::Value;
use serde_json::json;

use crate::connection::{Connection, ListenerRegistration};
use crate::events::{EventEmitter, CONNECTION_CLOSED_EVENT, CONNECTION_ESTABLISHED_EVENT};
use crate::wire::frame::Frame;

/// All established connections, keyed by clientId. The map holds at most
/// one live connection per clientId; registering a reconnecting client
/// evicts and closes the previous connection in the same locked section,
/// so no window exists where both are visible.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    emitter: Arc<EventEmitter>,
}

impl ConnectionRegistry {
    pub fn new(emitter: Arc<EventEmitter>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            emitter,
        }
    }

    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }

    /// Registers a connection, returning the evicted predecessor if the
    /// clientId was already connected.
    pub fn add(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let evicted = {
            let mut connections = self
                .connections
                .lock()
                .expect("connection registry lock poisoned");
            connections.insert(connection.client_id().to_owned(), Arc::clone(&connection))
        };

        if let Some(previous) = &evicted {
            previous.close();
            self.emit_closed(previous);
        }
        let _ = self.emitter.emit(
            CONNECTION_ESTABLISHED_EVENT,
            Some(json!({
                "clientId": connection.client_id(),
                "clientName": connection.client_name(),
                "connectedAt": connection.connected_at().to_rfc3339(),
            })),
        );

        evicted
    }

    /// Removes and closes a connection, but only if this exact instance
    /// still owns its clientId slot. A connection evicted by a reconnect
    /// must not tear down its successor when its read loop winds down.
    pub fn remove(&self, connection: &Arc<Connection>) -> bool {
        let removed = {
            let mut connections = self
                .connections
                .lock()
                .expect("connection registry lock poisoned");
            match connections.get(connection.client_id()) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    connections.remove(connection.client_id());
                    true
                }
                _ => false,
            }
        };

        if removed {
            connection.close();
            self.emit_closed(connection);
        }
        removed
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connection registry lock poisoned")
            .get(client_id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.connections
            .lock()
            .expect("connection registry lock poisoned")
            .len()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connection registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self
                .connections
                .lock()
                .expect("connection registry lock poisoned");
            connections.drain().map(|(_, connection)| connection).collect()
        };

        for connection in drained {
            connection.close();
            self.emit_closed(&connection);
        }
    }

    /// Sends the frame to every open connection matching the predicate.
    /// Returns how many connections it was written to.
    pub fn emit<F>(&self, frame: &Frame, predicate: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let mut delivered = 0;
        for connection in self.snapshot() {
            if !connection.is_open() || !predicate(&connection) {
                continue;
            }
            if matches!(connection.send_frame(frame), Ok(written) if written > 0) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.emit(frame, |_| true)
    }

    /// Targeted fan-out by listener key: each connection owning at least
    /// one of the keys receives one `evt:on` frame listing only its own
    /// subset. Connections with no matched key receive nothing.
    pub fn emit_keys(&self, keys: &[String], data: &Value) -> usize {
        self.fan_out(|connection| connection.filter_keys(keys), data)
    }

    /// Predicate fan-out for server-initiated emission: matches listeners
    /// by event name and an opaque-info predicate.
    pub fn emit_event<F>(&self, event_name: &str, predicate: F, data: &Value) -> usize
    where
        F: Fn(&Value) -> bool,
    {
        self.fan_out(
            |connection| connection.matching_keys(event_name, &predicate),
            data,
        )
    }

    fn fan_out<F>(&self, matched_keys: F, data: &Value) -> usize
    where
        F: Fn(&Connection) -> Vec<String>,
    {
        let mut delivered = 0;
        for connection in self.snapshot() {
            if !connection.is_open() {
                continue;
            }
            let matched = matched_keys(&connection);
            if matched.is_empty() {
                continue;
            }
            let frame = Frame::evt_on(matched, data.clone());
            if matches!(connection.send_frame(&frame), Ok(written) if written > 0) {
                delivered += 1;
            }
        }
        delivered
    }

    /// All registrations for an event name across every live connection.
    pub fn listener_registrations(&self, event_name: &str) -> Vec<ListenerRegistration> {
        let mut registrations = Vec::new();
        for connection in self.snapshot() {
            registrations.extend(connection.listeners_for(event_name));
        }
        registrations
    }

    fn emit_closed(&self, connection: &Connection) {
        let _ = self.emitter.emit(
            CONNECTION_CLOSED_EVENT,
            Some(json!({
                "clientId": connection.client_id(),
                "clientName": connection.client_name(),
            })),
        );
    }
}
