pub mod admission;
pub mod backends;
pub mod cache;
pub mod config;
pub mod errors;
pub mod job;
pub mod reporter;
pub mod service;
pub mod streamer;

pub use compile_common;
