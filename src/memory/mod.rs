//! 记忆层：会话内的目标树 / 事实表 / 访问与失败记录，以及键值持久化

pub mod persistence;
pub mod store;

pub use persistence::{
    load_json, memory_key, save_json, InMemoryPersistence, JsonFilePersistence, Persistence,
    PersistenceError, SESSION_KEY,
};
pub use store::{
    Fact, FactSource, FactUpdate, FailedStrategy, GoalId, GoalNode, GoalStatus, MemoryStore,
};
