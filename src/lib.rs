//! The session execution core for a multi-tenant, multi-pod alert-
//! investigation service: a queue worker pool that claims pending
//! sessions, fans each stage's agents out and aggregates their results,
//! synthesizes multi-agent stages, recovers orphaned sessions left behind
//! by a crashed pod, and runs the asynchronous chat follow-up path.
//!
//! Module map:
//! - [`error`] — the crate-wide error taxonomy
//! - [`model`] — entity shapes (`Session`, `Stage`, `AgentExecution`, ...)
//! - [`config`] — the configuration surface (chains, agents, guardrails)
//! - [`ctx`] — cooperative cancellation contexts
//! - [`event`] — the best-effort event/progress publisher contract
//! - [`collaborators`] — narrow interfaces to the LLM client, tool
//!   executor, agent controllers, and runbook resolver
//! - [`store`] / [`pg_store`] — the persistence trait and its Postgres and
//!   in-memory implementations
//! - [`mcp_selection`] — MCP server/tool selection resolution
//! - [`agent_invocation`] — running one agent within a stage
//! - [`stage`] — fanning a stage's agents out and aggregating results
//! - [`synthesis`] — consolidating a multi-agent stage, executive summaries
//! - [`executor`] — driving one session through its chain
//! - [`worker`] / [`pool`] — the claim-loop worker and the pool that owns them
//! - [`orphan`] — periodic and startup orphan recovery
//! - [`chat`] — the asynchronous, one-at-a-time chat follow-up path

pub mod agent_invocation;
pub mod chat;
pub mod collaborators;
pub mod config;
pub mod ctx;
pub mod error;
pub mod event;
pub mod executor;
pub mod mcp_selection;
pub mod model;
pub mod orphan;
pub mod pg_store;
pub mod pool;
pub mod stage;
pub mod store;
pub mod synthesis;
pub mod worker;

pub use chat::ChatExecutor;
pub use error::{BoxError, CoreError};
pub use executor::ExecutorDeps;
pub use pg_store::PgStore;
pub use pool::{PoolHealth, WorkerPool};
pub use store::{MemoryStore, SessionStore};
