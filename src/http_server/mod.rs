pub mod app;
mod error;
pub mod state;
