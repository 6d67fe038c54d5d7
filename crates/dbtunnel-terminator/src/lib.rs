//! Tunnel terminator
//!
//! Serves HTTP/2 and turns every request into a tunnel to a fixed backend. The
//! backend is dialed with a retry budget so a cold-starting database gets time
//! to come up; if it never does, the request is answered with a 500.

mod server;

pub use server::{
    Terminator, TerminatorConfig, TerminatorError, BACKEND_UNAVAILABLE_BODY, DEFAULT_DRAIN_TIMEOUT,
    SHUTTING_DOWN_BODY,
};
