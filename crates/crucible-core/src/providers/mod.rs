pub mod agent;
pub mod target;
