pub mod condition;
pub mod error;
pub mod guard;

pub use condition::{Condition, ConditionTimeout, Waiter};
pub use guard::run_guarded;
