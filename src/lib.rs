#![forbid(unsafe_code)]
#![doc = r#"
Modelgate

OpenAI-style HTTP gateway that forwards each request to the model-serving
backend named by its `model` field (vLLM, llama.cpp, or anything speaking the
same JSON API).

Crate highlights
- Hot-reloadable registry: YAML model config validated as a whole, swapped
  atomically, re-read when its modification time advances.
- Proxy: buffered JSON relay or live `text/event-stream` relay over one shared,
  capped connection pool.
- Optional bearer-token guard and one structured access record per request.

Modules
- `registry`: descriptors, config parsing, snapshots and reloads.
- `router`: reload check, lookup and capability check per request.
- `proxy`: outbound dispatch and the streaming relay decorator.
- `models`: minimal request shapes for chat, completions and embeddings.
- `auth`: access guard.
- `access_log`: request logger middleware and correlation ids.
- `error`: error taxonomy and its JSON envelope.
- `server`: Actix-web route table and handlers.
- `config`: command line and environment settings.
- `util`: tracing, HTTP client, CORS and shared state.
"#]

pub mod access_log;
pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod server;
pub mod util;

pub use crate::access_log::CorrelationId;
pub use crate::auth::{AccessGuard, Verification};
pub use crate::error::GatewayError;
pub use crate::proxy::{DispatchSettings, Dispatcher, StreamOutcome};
pub use crate::registry::{BackendKind, ModelDescriptor, Registry, RegistrySnapshot, RegistryStats};
pub use crate::router::{ModelRouter, Operation};
