pub mod rate;
pub mod retry;
pub mod sql;
pub mod time;
