pub mod calculator;
pub mod worker;

pub use calculator::{RewardCalculator, RewardMode};
pub use worker::RewardWorker;
