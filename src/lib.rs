pub mod boxes;
pub mod errors;
pub mod flow;
pub mod message;
pub mod queue;
pub mod services;
