// crates/taskcore/src/events/mod.rs

mod base;

pub use base::{EventBus, TaskEvent};
