#![forbid(unsafe_code)]

pub mod grading;
pub mod model;
pub mod progress;
pub mod sequencer;
pub mod time;

pub use time::Clock;
