//! Bluetooth Low Energy transport layer

pub mod adapter;

pub use adapter::BluerTransport;
