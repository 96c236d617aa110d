pub mod constants;
pub mod entities;
pub mod error;
pub mod ports;
pub mod services;
pub mod value_objects;

pub use entities::{
    ActionSpec, ChildPolicy, ConditionAction, ConditionSpec, ProcessDefinition,
    ProcessDefinitionBuilder, ProcessSnapshot, TransitionAction, TriggerSpec,
};
pub use error::{DomainError, Result};
pub use value_objects::{
    edges, parse_memory, parse_percent, BreachRule, Edge, Event, Guard, ProcessSignal,
    ProcessState, StdinSource, Transition,
};
