//! HTTP request handlers.

pub mod capabilities;
pub mod health;

pub use capabilities::*;
pub use health::*;
