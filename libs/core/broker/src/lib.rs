//! Broker
//!
//! A transport-agnostic message broker engine: register named handlers, publish
//! messages (immediately or delayed), and let a pool of worker loops deliver them
//! with bounded retry and graceful shutdown.
//!
//! ## Features
//!
//! - **Handler registry**: one handler per message name, duplicates rejected
//! - **Middleware**: onion-style layers around every invocation, panics recovered
//! - **Bounded retry**: a failing message is attempted at most `max_reconsume` times
//! - **Delayed delivery**: native or emulated per transport, never delivered early
//! - **Reconnect**: loops pause while the link is down and resume once it is back
//! - **Transports**: in-memory, and Redis Streams behind the `redis` feature
//! - **Prometheus metrics**: built-in observability
//!
//! ## Example
//!
//! ```ignore
//! use broker::{handler_fn, Broker, BrokerConfig, HandlerError, Message, MemoryTransport};
//!
//! let broker = Broker::new(
//!     MemoryTransport::new(),
//!     BrokerConfig::new("bee").with_concurrency(4).with_max_reconsume(3),
//! );
//!
//! broker.register("print", handler_fn(|msg: Message| async move {
//!     println!("{}", msg.decode::<String>()?);
//!     Ok::<_, HandlerError>(())
//! }))?;
//!
//! broker.worker().await?;
//! broker.send("print", "a").await?;
//! broker.close().await?;
//! ```

mod abandon;
mod backoff;
mod broker;
mod config;
mod delay;
mod error;
mod handler;
mod link;
mod message;
pub mod metrics;
mod middleware;
mod retry;
pub mod transport;
mod worker;

// Re-export main types
pub use abandon::{AbandonHandler, Abandoned, LogAbandoned};
pub use backoff::{retry_with_backoff, BackoffConfig};
pub use broker::{Broker, LifecycleState};
pub use config::{BrokerConfig, DeliveryMode, Ordering};
pub use delay::{DelayDescriptor, DelayMechanism, DelayMode, DelayScheduler};
pub use error::{BrokerError, ErrorCategory, HandlerError, LifecycleError, TransportError};
pub use handler::{handler_fn, Handler, HandlerFn, HandlerRegistry};
pub use link::Connectivity;
pub use message::{Delivery, Message};
pub use metrics::{init_metrics, render_metrics, BrokerMetrics};
pub use middleware::{Logging, Middleware, MiddlewareChain, Next, Recover, Timeout};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{MemoryTransport, Transport};
#[cfg(feature = "redis")]
pub use transport::{RedisStreamTransport, RedisTransportConfig};
