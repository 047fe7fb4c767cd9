pub mod context;
pub mod engine;
pub mod history;
pub mod state;
