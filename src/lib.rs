#[macro_use]
extern crate log;

pub mod counter;
pub mod map;
pub(crate) mod thread_id;
