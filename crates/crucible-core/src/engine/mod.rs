//! Run orchestration: dispatch, per-unit execution, fan-in and finalization.

pub mod aggregator;
pub mod controller;
pub mod dispatcher;
pub mod latch;
pub mod queue;
pub mod retry;
pub mod service;
pub mod worker;
