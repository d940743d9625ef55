pub mod error;
pub mod math;
pub mod prices;
pub mod returns;
pub mod types;
pub mod weights;

#[cfg(feature = "optimization")]
pub mod optimization;

#[cfg(feature = "screening")]
pub mod screening;

#[cfg(feature = "allocation")]
pub mod allocation;

pub use error::FolioError;
pub use types::*;

/// Standard result type for all folio operations
pub type FolioResult<T> = Result<T, FolioError>;
