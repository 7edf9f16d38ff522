pub mod config;
pub mod director;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod external;
pub mod ledger;
pub mod monitor;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod tracking;
pub mod transport;

pub use error::{Error, Result};
