//! Web control surface and viewer sockets

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{AppState, WebServer};
