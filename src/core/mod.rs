//! Core business logic module

pub mod cancel;
pub mod chunking;
pub mod discovery;
pub mod error;
pub mod service;
pub mod transfer;
pub mod types;
