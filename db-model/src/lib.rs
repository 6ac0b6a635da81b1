pub mod persist;
pub mod ping_store;
pub mod schema;
