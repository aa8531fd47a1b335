//! Database engine adapters shipped with the crate.

pub mod postgres;

pub use postgres::PostgresAdapter;
