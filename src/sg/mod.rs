//! SCSI generic (`sg`) transport: the uapi surface, the device handle, and
//! completion classification, split the way spec.md §2 budgets them as
//! separate components.

pub mod device;
pub mod transport;
pub mod uapi;

pub use device::{Completion, SgDevice, Version};
pub use transport::{classify, Outcome};
