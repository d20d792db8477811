//! `familymap` - Real-time family location sharing
//!
//! This library signs a user in to a hosted backend, publishes the device
//! position to the shared member table, and keeps a live map and member list
//! of everyone's last known location.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod app;
pub mod backend;
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod map;
pub mod publisher;
pub mod roster;
pub mod session;
pub mod storage;
pub mod subscriber;
pub mod ui;

pub use app::{App, Collaborators};
pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use roster::{Member, RosterFetcher};
pub use session::{Credentials, Session, SessionManager};
pub use storage::{CacheStats, LocalStore};
