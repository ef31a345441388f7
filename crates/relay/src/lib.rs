pub mod app;
pub mod auth;
pub mod broker;
pub mod collab;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod history;
pub mod metrics;
pub mod outbound;
pub mod registry;
pub mod room;
pub mod ws;
