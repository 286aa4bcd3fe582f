pub mod manager;

pub use manager::{ReadOutcome, ReadSignal, SessionManager};
