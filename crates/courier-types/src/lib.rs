//! Wire and domain types shared by the store, the gateway and the server.

pub mod api;
pub mod events;
pub mod models;
