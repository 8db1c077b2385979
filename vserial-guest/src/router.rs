//! Route table and handler dispatch types.
//!
//! The table is built once at startup and immutable afterwards; duplicate
//! registration of a `(method, path)` pair is a startup fatal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use vserial_proto::http::{DEFAULT_MAX_BODY_BYTES, Method};

use crate::error::HandlerResult;

/// Hard ceiling on any handler deadline, whatever the caller asks for.
pub const MAX_HANDLER_SECONDS: u64 = 120;

/// Everything a handler may look at: the parsed query map, the decoded
/// envelope fields, the request id for logging, and the absolute deadline
/// it must respect. Handlers borrow the context for the duration of one
/// call and retain nothing.
pub struct HandlerContext {
    pub query: HashMap<String, String>,
    pub action: Option<String>,
    pub params: Value,
    pub request_id: String,
    pub deadline: Instant,
}

impl HandlerContext {
    /// Fetch a required string parameter.
    pub fn require_str(&self, key: &str) -> Result<&str, crate::error::HandlerError> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| crate::error::HandlerError::missing(key))
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &HandlerContext) -> HandlerResult;
}

/// Per-route limits and flags.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    pub max_body_bytes: usize,
    pub default_timeout: Duration,
    pub auth_required: bool,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            default_timeout: Duration::from_secs(30),
            auth_required: false,
        }
    }
}

pub struct RouteEntry {
    pub handler: Arc<dyn Handler>,
    pub options: RouteOptions,
}

impl std::fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEntry")
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Debug, Error)]
#[error("duplicate route registration: {method} {path}")]
pub struct DuplicateRoute {
    pub method: Method,
    pub path: String,
}

/// Builder for the immutable route table.
#[derive(Default, Debug)]
pub struct RouterBuilder {
    routes: HashMap<(Method, String), RouteEntry>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        method: Method,
        path: impl Into<String>,
        handler: Arc<dyn Handler>,
        options: RouteOptions,
    ) -> Result<&mut Self, DuplicateRoute> {
        let path = path.into();
        let key = (method, path.clone());
        if self.routes.contains_key(&key) {
            return Err(DuplicateRoute { method, path });
        }
        self.routes.insert(key, RouteEntry { handler, options });
        Ok(self)
    }

    pub fn build(self) -> Router {
        Router {
            routes: self.routes,
        }
    }
}

/// Immutable `(method, path) → handler` table.
pub struct Router {
    routes: HashMap<(Method, String), RouteEntry>,
}

impl Router {
    /// Look up a route by method and path without query string.
    pub fn resolve(&self, method: Method, path: &str) -> Option<&RouteEntry> {
        self.routes.get(&(method, path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
