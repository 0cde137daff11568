pub mod schema;

pub use schema::{Config, MailConfig, ReliabilityConfig};
