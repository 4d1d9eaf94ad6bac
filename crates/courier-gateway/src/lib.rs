pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod presence;
pub mod pubsub;
pub mod registry;
pub mod rooms;
pub mod store;
pub mod typing;
pub mod unread;
pub mod viewport;

pub use auth::{CredentialVerifier, Identity, JwtVerifier};
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::{Collaborators, Gateway, Session};
pub use pipeline::Draft;
