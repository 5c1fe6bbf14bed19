pub mod routes;
pub mod ws;

pub use routes::{router, ApiError, AppState};
