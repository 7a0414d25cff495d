mod core;
mod entity;
mod link;
mod schema;

pub use self::core::Database;
