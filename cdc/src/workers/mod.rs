pub mod base;
pub mod dispatcher;
pub mod reader;
