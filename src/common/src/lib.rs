#[macro_use]
extern crate async_trait;

pub mod error;
pub mod iterator;
pub mod time;
