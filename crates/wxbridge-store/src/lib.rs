pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::MessageStore;
pub use types::{StoredFile, StoredMessage};
