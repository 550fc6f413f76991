pub mod backend;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod version;
pub mod worker;

pub use error::{Result, TaskFailure, TaskfoldError};
