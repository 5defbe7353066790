//! # Fleet Install
//!
//! Installs, updates and removes a multi-host blockchain network from one
//! coordinating node. Followers register their roles, fetch a role-appropriate
//! install package, run the local install scripts and report completion. Every
//! node's lifecycle is checkpointed in an embedded SQLite store.
//!
//! ## Core Parts
//!
//! - **Checkpoint store**: declarative entity schemas, a lazily bootstrapped
//!   connection pool and a lock-serialized CRUD facade with self-healing upsert
//! - **Coordinator**: role resolution, package building and the install/update/remove/end commands
//! - **Follower**: package handling and local script execution
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fleet_install::{Config, InstallerBuilder};
//!
//! let config = Config::create("fleet-install.toml")?;
//! let installer = InstallerBuilder::new().config(config).build()?;
//! installer.launch().await?;
//! ```

mod builder;
mod common;
mod config;
mod error;
mod installer;
mod utils;

pub mod coordinator;
pub mod follower;
pub mod protocol;
pub mod server;
pub mod store;

pub use builder::InstallerBuilder;
pub use config::*;
pub use error::FleetError;
pub use installer::Installer;

/// Result type alias for installer operations.
pub type Result<T> = std::result::Result<T, FleetError>;
