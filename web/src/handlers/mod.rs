//! HTTP handlers shared by Steadfast services.

pub mod health;

pub use health::health_check;
