pub mod state_machine;

pub use state_machine::{
    transition, Effect, OperationEvent, OperationState, ParseStateError, Transition,
    TransitionContext, TransitionError,
};
