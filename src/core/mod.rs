pub mod assembler;
pub mod block;
pub mod chain;
pub mod engine;
pub mod events;
pub mod interceptors;
pub mod model;
pub mod planner;
pub mod speed;
pub mod store;
pub mod task;

#[cfg(test)]
pub mod testing;
