// HTTP API: token store, token, status, disconnect, OAuth flow
pub mod api;

// Request identity
pub mod auth;

// Client-side capture and disconnect coordination
pub mod client;

pub mod config;

// Credential records and the services built on them
pub mod credentials;

pub mod error;

// Provider endpoints and outbound OAuth calls
pub mod provider;

// Secret storage behind opaque references
pub mod vault;
