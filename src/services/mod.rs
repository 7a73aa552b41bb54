//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own business logic and persistence concerns so route
//! handlers can stay focused on protocol translation and auth plumbing.

pub mod account;
pub mod ai;
pub mod chat;
pub mod friend;
pub mod maintenance;
pub mod notice;
pub mod oauth;
pub mod password_reset;
pub mod presence;
pub mod room;
pub mod session;
pub mod stage;
pub mod subscription;
