//! IRC bouncer: authenticates reconnecting clients, replays the welcome
//! burst and missed history from storage, then relays live traffic.

pub mod auth;
pub mod backend;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod event;
pub mod feed;
pub mod forward;
pub mod irc;
pub mod playback;
pub mod relay;
pub mod server;
pub mod session;
pub mod welcome;
