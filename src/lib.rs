//! SakuraCloud machine controller
//!
//! Converges declarative machine records onto SakuraCloud servers. Cloud work
//! runs in background jobs tracked by an in-process registry, and each
//! reconcile pass only inspects those jobs and applies one state transition.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
