pub mod series;

pub use series::{FileSeriesWal, RecoveryHandler, SeriesWal, WalEntry, WalOptions};
