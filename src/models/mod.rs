//! Data models

mod billing;
mod change_request;
mod client;
mod membership;
mod organization;
mod plan;
mod user;

pub use billing::*;
pub use change_request::*;
pub use client::*;
pub use membership::*;
pub use organization::*;
pub use plan::*;
pub use user::*;
