pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod io;
pub mod lock;
pub mod paths;
pub mod plan;
pub mod rate_limiter;
pub mod record;
pub mod remote;

pub use error::{CrmError, Result};
