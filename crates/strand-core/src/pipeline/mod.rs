//! 通知管线：收集、排序、解析与按方法缓存。

pub(crate) mod builder;
pub mod configuration;
pub(crate) mod ordering;

pub use configuration::MethodInvocationConfiguration;
