pub mod config;
pub mod resource;
pub mod types;

pub use config::{AuthKind, ChecksumAlgo, RmConfig, RmSubtype, SchedConfig, SchedulerPolicy};
pub use resource::{ResourceVector, UNLIMITED};
pub use types::*;

/// Upper bound for human-readable failure messages.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Truncate `msg` to at most [`MAX_MESSAGE_LEN`] bytes on a char boundary.
pub fn bounded_message(msg: impl Into<String>) -> String {
    let mut msg = msg.into();
    if msg.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        msg.truncate(end);
    }
    msg
}
