pub mod audit;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod service;
pub mod voting;

pub use config::LedgerConfig;
pub use error::{ErrorClass, LedgerError};
pub use service::LedgerServices;
