pub mod sink;
pub mod sql;
pub mod state;
pub mod supervisor;
