//! Middlewares of the HTTP server.

mod handle_panic;
mod trace;

pub use self::handle_panic::*;
pub use self::trace::*;
