pub mod analyze;
pub mod cli;
pub mod config;
pub mod driver;
pub mod pipeline;
pub mod store;
pub mod trace;

pub use analyze::{ApiCounter, SourceKey};
pub use config::Config;
pub use driver::{Driver, Job};
pub use pipeline::Pipeline;
pub use store::AggregateStore;
