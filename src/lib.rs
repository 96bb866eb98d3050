pub mod config;
pub mod error;
pub mod identity;
pub mod membership;
pub mod planner;
pub mod retry;
pub mod shutdown;
pub mod supervisor;
pub mod watcher;

pub use error::{Result, ShepherdError};
