//! 执行层：动作模型、上下文快照、Actuator / ContextProvider 抽象、带超时的执行器、模拟页面

pub mod action;
pub mod executor;
pub mod simulated;
pub mod snapshot;
pub mod traits;

pub use action::{Action, ActionKind, PlannedAction, Point, ScrollDirection};
pub use executor::ActionExecutor;
pub use simulated::{SimElement, SimPage, SimulatedSurface};
pub use snapshot::{
    normalize_address, origin_of, ContextSnapshot, ElementSignature, StructuralDiff, TargetId,
};
pub use traits::{
    ActionOutcome, Actuator, ActuatorError, ContextError, ContextProvider, TargetInfo,
};
