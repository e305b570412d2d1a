//! Encrypted credential store library

pub mod app;
pub mod cipher;
pub mod codec;
pub mod command;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod hash;
pub mod model;
pub mod notify;
pub mod secure;
pub mod storage;
pub mod store;

pub use error::{Result, VaultError};
