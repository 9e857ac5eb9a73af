pub mod accumulator;
pub mod adapter;
pub mod concurrency;
pub mod config;
pub mod executor;
pub mod export;
pub mod orchestrator;
pub mod outcome;
pub mod rate_limiter;
pub mod retry;
pub mod timer;
pub mod timing;

pub use accumulator::*;
pub use adapter::*;
pub use concurrency::*;
pub use config::*;
pub use executor::*;
pub use export::*;
pub use orchestrator::*;
pub use outcome::*;
pub use rate_limiter::*;
pub use retry::*;
pub use timer::*;
pub use timing::*;
