pub mod engine;
pub mod simulator;
pub mod tools;
