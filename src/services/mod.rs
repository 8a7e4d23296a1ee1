use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use rmpv::Value;

use crate::connection::Connection;
use crate::registry::ConnectionRegistry;

/// Access requirement for a service or one of its methods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Permission {
    /// Callable without a token.
    Open,
    /// Any verified token is enough.
    LoginRequired,
    /// A verified token holding at least one of these roles.
    Roles(Vec<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessDenied {
    Unauthenticated,
    Unauthorized,
}

impl Permission {
    pub fn check(&self, connection: &Connection) -> Result<(), AccessDenied> {
        match self {
            Self::Open => Ok(()),
            Self::LoginRequired => {
                if connection.is_authenticated() {
                    Ok(())
                } else {
                    Err(AccessDenied::Unauthenticated)
                }
            }
            Self::Roles(required) => {
                if !connection.is_authenticated() {
                    return Err(AccessDenied::Unauthenticated);
                }
                if required.iter().any(|role| connection.has_role(role)) {
                    Ok(())
                } else {
                    Err(AccessDenied::Unauthorized)
                }
            }
        }
    }
}

/// Everything a handler sees for one call. Built fresh per dispatch; the
/// registry reference lets handlers push frames to other clients.
pub struct CallContext<'a> {
    pub registry: &'a ConnectionRegistry,
    pub connection: &'a Arc<Connection>,
    pub args: &'a [Value],
}

#[derive(Debug)]
pub struct ServiceError {
    pub name: String,
    pub message: String,
}

impl ServiceError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ServiceError {}

pub type ServiceHandler = Arc<dyn Fn(&CallContext) -> Result<Value, ServiceError> + Send + Sync>;

struct MethodEntry {
    handler: ServiceHandler,
    permission: Option<Permission>,
}

/// One registered service: a class-level permission and named methods.
/// A method-level permission overrides the class permission entirely.
pub struct ServiceDefinition {
    name: String,
    permission: Permission,
    methods: HashMap<String, MethodEntry>,
}

impl ServiceDefinition {
    /// Services default to `Open`: a definition that never states a
    /// permission is public, and login-only requires an explicit
    /// `LoginRequired` (the empty role list).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permission: Permission::Open,
            methods: HashMap::new(),
        }
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    pub fn method<F>(self, method_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CallContext) -> Result<Value, ServiceError> + Send + Sync + 'static,
    {
        self.method_entry(method_name, None, handler)
    }

    pub fn method_with_permission<F>(
        self,
        method_name: impl Into<String>,
        permission: Permission,
        handler: F,
    ) -> Self
    where
        F: Fn(&CallContext) -> Result<Value, ServiceError> + Send + Sync + 'static,
    {
        self.method_entry(method_name, Some(permission), handler)
    }

    fn method_entry<F>(
        mut self,
        method_name: impl Into<String>,
        permission: Option<Permission>,
        handler: F,
    ) -> Self
    where
        F: Fn(&CallContext) -> Result<Value, ServiceError> + Send + Sync + 'static,
    {
        self.methods.insert(
            method_name.into(),
            MethodEntry {
                handler: Arc::new(handler),
                permission,
            },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A resolved call target: the handler plus the permission that governs it.
pub struct ResolvedMethod {
    pub handler: ServiceHandler,
    pub permission: Permission,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResolveError {
    ServiceNotFound { service: String },
    MethodNotFound { service: String, method: String },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceNotFound { service } => write!(f, "service '{service}' is not registered"),
            Self::MethodNotFound { service, method } => {
                write!(f, "service '{service}' has no method '{method}'")
            }
        }
    }
}

impl std::error::Error for ResolveError {}

#[derive(Default)]
pub struct ServiceTable {
    services: RwLock<HashMap<String, ServiceDefinition>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a service under an existing name replaces it.
    pub fn register(&self, definition: ServiceDefinition) {
        self.services
            .write()
            .expect("service table lock poisoned")
            .insert(definition.name.clone(), definition);
    }

    pub fn resolve(&self, service: &str, method: &str) -> Result<ResolvedMethod, ResolveError> {
        let services = self.services.read().expect("service table lock poisoned");
        let definition = services
            .get(service)
            .ok_or_else(|| ResolveError::ServiceNotFound {
                service: service.to_owned(),
            })?;
        let entry = definition
            .methods
            .get(method)
            .ok_or_else(|| ResolveError::MethodNotFound {
                service: service.to_owned(),
                method: method.to_owned(),
            })?;

        Ok(ResolvedMethod {
            handler: Arc::clone(&entry.handler),
            permission: entry
                .permission
                .clone()
                .unwrap_or_else(|| definition.permission.clone()),
        })
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .expect("service table lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
