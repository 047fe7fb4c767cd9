pub mod tools;
pub mod transport;
pub mod types;
pub mod writer;
