//! Model resolution for inbound requests.
//!
//! Every request that names a model goes through [`ModelRouter::route`]:
//! a cheap reload check, a registry lookup, then a capability check for the
//! requested operation.

use std::fmt;
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::registry::{ModelDescriptor, Registry};

/// Model-facing operations the gateway can proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ChatCompletions,
    Completions,
    Embeddings,
}

impl Operation {
    /// Backend path this operation is forwarded to.
    pub fn path(&self) -> &'static str {
        match self {
            Operation::ChatCompletions => "/v1/chat/completions",
            Operation::Completions => "/v1/completions",
            Operation::Embeddings => "/v1/embeddings",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ChatCompletions => "chat completions",
            Operation::Completions => "completions",
            Operation::Embeddings => "embeddings",
        }
    }

    /// Whether `descriptor` can serve this operation.
    pub fn is_supported_by(&self, descriptor: &ModelDescriptor) -> bool {
        match self {
            Operation::ChatCompletions | Operation::Completions => true,
            Operation::Embeddings => descriptor.supports_embeddings,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ModelRouter {
    registry: Arc<Registry>,
}

impl ModelRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Check the config source for changes. A failed request-time reload is
    /// logged and traffic stays on the last good snapshot.
    pub fn refresh(&self) {
        match self.registry.maybe_reload() {
            Ok(true) => tracing::info!("model config changed on disk; registry reloaded"),
            Ok(false) => {}
            Err(err) => tracing::error!(
                error = %err,
                "failed to reload model config; serving last good snapshot"
            ),
        }
    }

    /// Resolve `model` for `operation`.
    pub fn route(&self, model: &str, operation: Operation) -> Result<Arc<ModelDescriptor>> {
        self.refresh();
        let descriptor = self.registry.resolve(model)?;
        if !operation.is_supported_by(&descriptor) {
            return Err(GatewayError::CapabilityUnsupported {
                model: descriptor.name.clone(),
                operation: operation.to_string(),
            });
        }
        Ok(descriptor)
    }
}
