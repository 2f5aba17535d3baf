//! `SyncStore` + `CursorStore` backends.

pub mod memory;
pub mod sqlite;
