mod app;
mod assignment;

pub use app::{app, AppState};
