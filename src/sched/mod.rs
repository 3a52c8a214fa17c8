pub mod event_loop;
pub mod request;

pub use event_loop::{EventLoop, TimerHandle};
pub use request::{Completion, Operation, Reply, Request};
