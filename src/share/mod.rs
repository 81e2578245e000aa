//! Sharing.
//!
//! - Tickets: files shared out by their owner
//! - Grants: upload slots through which others share files in
//! - Password hashing for both

mod grant;
mod password;
mod ticket;

pub use grant::{Grant, GrantRepository, GrantService, GrantWithFiles, NewGrant, PublicGrant};
pub use password::{hash_password, verify_password};
pub use ticket::{
    NewTicket, PublicTicket, Ticket, TicketRepository, TicketService, TicketWithFiles,
};
