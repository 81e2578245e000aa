//! frans - file sharing core
//!
//! A deduplicating content store for shared files, with policy-driven
//! expiry and periodic lifecycle sweeps.

pub mod config;
pub mod datetime;
pub mod db;
pub mod error;
pub mod expiry;
pub mod file;
pub mod lifecycle;
pub mod logging;
pub mod share;

pub use config::Config;
pub use db::{Database, NewUser, PublicUser, User, UserRepository};
pub use error::{FransError, Result};
pub use expiry::{Expirable, ExpiryDefaults, ExpiryPolicy, ExpiryType};
pub use file::{
    AggregateRefresher, ContentStore, FileRecord, FileRepository, FileService, PendingBlobs,
    PublicFile, Upload,
};
pub use lifecycle::{LifecycleScheduler, LifecycleSweeper, SweepKind, SweepReport};
pub use share::{
    Grant, GrantService, GrantWithFiles, NewGrant, NewTicket, Ticket, TicketService,
    TicketWithFiles,
};
