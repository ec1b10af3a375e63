pub mod audit;
pub mod notifier;
pub mod scheduler;
