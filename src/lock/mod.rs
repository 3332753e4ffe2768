pub mod table;

pub use table::{LockGrant, LockId, ResourceLockTable};
