//! Database models split into separate files.

pub mod checkpoint;
pub mod manual_entry;

pub use self::checkpoint::*;
pub use self::manual_entry::*;
