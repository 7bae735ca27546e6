//! Configuration schema, loader, and startup validation for the siftmail
//! content-analysis daemon.
//!
//! The schema (`schema::RawConfig`) is a plain serde-derived mirror of the
//! TOML file shape; [`ConfigLoader`] reads it via the `config` crate plus
//! environment overrides, and [`convert::validate`] lowers it into the
//! runtime types `siftmail_core` operates on, collecting [`ConfigWarnings`]
//! and refusing to start on a [`ConfigGuardRailError`].

pub mod convert;
pub mod error;
pub mod loader;
pub mod schema;
pub mod warnings;

pub use convert::RuntimeConfig;
pub use error::{ConfigGuardRailError, ConfigLoadError};
pub use loader::{ConfigLoad, ConfigLoader};
pub use schema::RawConfig;
pub use warnings::{ConfigWarning, ConfigWarnings};
