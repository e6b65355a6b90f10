pub mod engine;
pub mod payload;
pub mod sse;
pub mod upstream;
