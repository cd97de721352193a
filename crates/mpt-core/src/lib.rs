pub mod error;
pub mod time_value;
pub mod types;

#[cfg(feature = "portfolio_optimization")]
pub mod portfolio_optimization;

#[cfg(feature = "returns")]
pub mod portfolio;

pub use error::MptError;
pub use types::*;

/// Standard result type for all mpt-core operations
pub type MptResult<T> = Result<T, MptError>;
