pub mod fetch;
pub mod parse;
pub mod types;
