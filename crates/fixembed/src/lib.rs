pub mod commands;
pub mod config;
pub mod database;
pub mod delivery;
pub mod discord;
pub mod error;
pub mod guilds;
pub mod pipeline;
pub mod retry;
pub mod rewrite;
pub mod service;
pub mod state;
pub mod toggle_view;
