pub mod process_definition;

pub use process_definition::{
    ActionSpec, ChildPolicy, ConditionAction, ConditionCallback, ConditionSpec,
    ProcessDefinition, ProcessDefinitionBuilder, ProcessSnapshot, TransitionAction,
    TransitionCallback, TriggerSpec,
};
