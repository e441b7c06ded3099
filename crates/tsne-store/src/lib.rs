pub mod config;
pub mod error;
pub mod exchange;
pub mod tsv;

pub use config::RunConfig;
pub use error::{Result, StoreError};
pub use exchange::{DataFile, ExchangeKind, ExchangeParams, ResultFile, identify};
