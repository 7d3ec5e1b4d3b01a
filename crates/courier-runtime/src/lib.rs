//! Courier runtime
//!
//! The engine behind the courier publishing client. A single worker task
//! owns the broker session, the outbound queue and the delivery-tag
//! counter; callers interact through a cheap cloneable handle:
//!
//! - `PublisherBuilder` validates configuration and spawns the worker
//! - `PublisherHandle` enqueues messages, watches lifecycle state and
//!   drives the two shutdown paths (gentle drain, forced stop)
//! - `SyncPublisher` is the alternative mode: connect on demand, publish,
//!   block on the confirmation
//! - `MemoryBroker` is a scriptable in-memory broker for tests
//!
//! ```no_run
//! use courier_core::{BrokerNodeConfig, CourierConfig, OutboundMessage};
//! use courier_runtime::{MemoryBroker, PublisherBuilder};
//!
//! # async fn demo() -> courier_core::CourierResult<()> {
//! let config = CourierConfig::new(vec![BrokerNodeConfig::new("mq1", 5672)
//!     .with_credentials("courier", "secret")
//!     .with_exchange("events")]);
//! let handle = PublisherBuilder::new(config, MemoryBroker::new()).start()?;
//!
//! handle.enqueue(OutboundMessage::new(
//!     serde_json::json!({ "order": 42 }),
//!     "orders.created.certified".parse()?,
//! ))?;
//!
//! handle.finish_gently().await;
//! assert!(!handle.any_leftovers());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod connector;
pub mod returns;
pub mod shutdown;
pub mod sync_client;
pub mod testing;
mod worker;

pub use builder::{PublisherBuilder, PublisherHandle};
pub use connector::{AttemptOutcome, Reconnector};
pub use returns::{ReturnDisposition, ReturnRouter};
pub use shutdown::{DrainState, FinishSignal, Leftovers};
pub use sync_client::SyncPublisher;
pub use testing::{ConfirmMode, MemoryBroker, PublishRecord};
