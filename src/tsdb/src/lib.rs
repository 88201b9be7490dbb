#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate lazy_static;

pub mod engine;
pub mod indexdb;
pub mod metadb;
pub mod series;
pub mod wal;
