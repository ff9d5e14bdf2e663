//! Database module for PostgreSQL persistence.

mod pool;
mod receipts;
mod records;

pub use pool::*;
pub use receipts::*;
pub use records::*;
