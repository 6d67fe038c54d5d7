//! Tunnel initiator
//!
//! Accepts plain TCP connections from local database clients and carries each
//! one to the remote endpoint inside its own HTTP/2 POST request.

mod credential;
mod server;

pub use credential::{
    CredentialError, CredentialSource, MetadataIdentityToken, NoCredentials, StaticToken,
    TokenFile, DEFAULT_METADATA_ADDR,
};
pub use server::{Initiator, InitiatorConfig, InitiatorError};
