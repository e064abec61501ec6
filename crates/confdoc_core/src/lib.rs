pub mod config;
pub mod confluence;
pub mod digest;
pub mod directives;
pub mod error;
pub mod macros;
pub mod merge;
pub mod runtime;
pub mod summary;
pub mod upload;
pub mod watch;
