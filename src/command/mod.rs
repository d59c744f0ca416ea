//! Command resolution and dispatch
//!
//! Turns inbound messages into named commands and runs the registered
//! handler, with run/end notification around each invocation.

mod resolver;
mod router;

pub use resolver::{CommandResolver, JsonFieldResolver, NullResolver};
pub use router::{CommandHandler, CommandOutcome, CommandRouter};
