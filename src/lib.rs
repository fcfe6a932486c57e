//! Hangar — multiplexing registry and gateway for MCP tool providers.
//! Starts provider processes on demand, keeps them warm, supervises their
//! health with circuit breaking and idle reaping, and fans batched tool
//! calls out across them under global and per-provider concurrency limits.

pub mod batch;
pub mod bus;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod continuation;
pub mod error;
pub mod events;
pub mod guard;
pub mod handlers;
pub mod launch;
pub mod provider;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod singleflight;
pub mod workers;

#[cfg(test)]
pub(crate) mod test_util;

pub use batch::{BatchExecutor, BatchOptions, BatchResult, CallResult, CallSpec};
pub use bus::{Command, CommandBus, Query, QueryBus};
pub use concurrency::ConcurrencyManager;
pub use config::{HangarConfig, ProviderMode, ProviderSpec};
pub use context::{bootstrap, AppContext};
pub use continuation::ResponseCache;
pub use error::{HangarError, Result};
pub use events::{DomainEvent, EventBus, EventKind, EventPayload};
pub use guard::RateLimiter;
pub use provider::{HealthTracker, Provider, ProviderState, ToolCatalog};
pub use registry::ProviderRegistry;
pub use rpc::RpcClient;
pub use server::GatewayServer;
pub use singleflight::SingleFlight;
