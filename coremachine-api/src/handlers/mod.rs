mod app;
mod jobs;
mod platform;

pub use app::{add_routes, AppState};
