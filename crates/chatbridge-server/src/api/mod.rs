pub mod completions;
pub mod models;
pub mod response;
pub mod state;

pub use state::AppState;
