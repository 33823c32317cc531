// Gateway module - the narrow blockchain oracle seam and confirmation polling

mod oracle;
mod poller;

pub use oracle::*;
pub use poller::*;
