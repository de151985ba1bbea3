//! 分层配置：作用域树、配置形态与 TOML 覆盖。
//!
//! - [`scope`]：`Global → Module → Contract → Method` 节点与 [`ScopeTree`]；
//! - [`shape`]：形态标识、类型化设置与启用语义；
//! - [`overlay`]：`ScopeTree::apply_toml`。

pub mod overlay;
pub mod scope;
pub mod shape;

pub use scope::{ConfigurationScope, ScopeKind, ScopeTree, ScopeValue, module_name_of};
pub use shape::{AdviceConfig, ConfigShape, ConfigView, ENABLED, Setting, ShapeId};
