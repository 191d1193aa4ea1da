pub mod documents;
pub mod pool;
pub mod schema;

pub use documents::SqliteStore;
pub use pool::DbPool;
