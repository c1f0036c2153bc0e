//! 上下文层：多标签页注册表与跨标签页关联

pub mod registry;

pub use registry::{
    ContextRegistry, Correlation, RegistryError, SavedContext, SiteAggregate, TargetEvent,
    TargetState, SINGLE_TARGET_CONFIDENCE,
};
