//! OpenEM ingestor server
//!
//! HTTP control plane of the ingestor daemon. The UI submits dataset folders
//! with `POST /dataset`, follows the transfers with `GET /transfer` and the
//! `/events` stream, and removes them with `DELETE /transfer`.

pub mod api;
pub mod collections;
pub mod error;
pub mod events;
pub mod server;
pub mod state;

pub use error::{WebError, WebResult};
pub use server::{router, run_server};
pub use state::AppState;
