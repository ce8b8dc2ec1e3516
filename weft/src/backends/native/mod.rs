mod segment;

pub use segment::{AsyncWaitBegin, SharedBuffer, WaitStatus};
