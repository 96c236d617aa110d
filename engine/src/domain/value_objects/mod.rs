pub mod breach_rule;
pub mod process_state;
pub mod signal;
pub mod stdin_source;
pub mod threshold;

pub use breach_rule::BreachRule;
pub use process_state::{edges, Edge, Event, Guard, ProcessState, Transition};
pub use signal::ProcessSignal;
pub use stdin_source::StdinSource;
pub use threshold::{parse_memory, parse_percent};
