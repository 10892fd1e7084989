pub mod error;
pub mod types;

pub use error::{ErrorClass, MigrateError, Result};
pub use types::{ATTRIBUTES_KEY, QueryPage, Record, SaveError, SaveResult, record_str};
