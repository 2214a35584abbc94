//! Core business logic for Pollivu.

pub mod services;

pub use services::*;
