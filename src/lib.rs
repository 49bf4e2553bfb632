mod errors;

pub mod blocks;
pub mod bucket;
pub mod config;
pub mod fs;
pub mod listing;
pub mod read;
pub mod statcache;
pub mod workers;

pub use config::Config;
pub use errors::Error;
pub use fs::BucketFs;

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
