pub mod codec;
pub mod collector;
pub mod config;
pub mod dst;
pub mod observability;
pub mod publisher;
pub mod range_query;
pub mod savepoint;
pub mod server;
pub mod sink;
pub mod store;
pub mod window;

pub use codec::{Entry, ProducerId};
pub use collector::{CollectError, Collector, ProducerHandle};
pub use config::ServerConfig;
pub use publisher::{PublishError, Publisher};
pub use range_query::{RangeQueryResponse, RangeQueryResult};
pub use server::{Server, ServerError, ServerState};
pub use sink::{FileSink, LogSink, MemorySink, Sink};
pub use store::{FileStore, InMemoryStore, Store};
pub use window::{Window, WindowBounds};
