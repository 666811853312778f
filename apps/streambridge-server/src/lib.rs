//! streambridge-server: a rendezvous bridge that splices a provider's TCP
//! byte stream into a consumer's in-flight HTTP download, without storing
//! the file.
//!
//! A provider declares a file over `POST /register` and receives an
//! unguessable token plus a TCP endpoint. It connects there, handshakes
//! with a single JSON line, and waits. The first consumer to request
//! `GET /download/{token}` has the provider's bytes forwarded straight into
//! its response body; the session is single-use and is released on every
//! termination path.

pub mod acceptor;
pub mod api;
pub mod app_state;
pub mod bootstrap;
pub mod config;
pub mod health;
pub mod logging;
pub mod registry;
pub mod responses;
pub mod router;
pub mod session;
pub mod stats;
pub mod stream;
pub mod sweeper;
pub mod tasks;

pub use app_state::AppState;
pub use bootstrap::{start, Bridge};
pub use config::Config;
