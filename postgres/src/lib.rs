//! Postgres types shared by the CDC crates.

pub mod schema;
pub mod time;
