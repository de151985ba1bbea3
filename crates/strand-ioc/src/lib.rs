//! # strand-ioc：分层服务容器
//!
//! ## 角色定位（Why）
//! - 为拦截管线提供通知（Advice）实例与契约实现实例，确保单例、作用域、瞬态三种生命周期语义
//!   在父子容器链上保持一致；
//! - 作为工作区的叶子 crate，不依赖任何上层概念，可单独复用。
//!
//! ## 模块结构（What）
//! - [`key`]：服务键（具体类型或“族 + 类型参数”的闭合泛型）与类型擦除实例；
//! - [`lifetime`]：生命周期枚举；
//! - [`registration`]：注册描述、构造函数集合与释放钩子；
//! - [`container`]：解析、缓存、子作用域与释放；
//! - [`error`]：容器错误域。
//!
//! ## 使用方式（How）
//! ```rust
//! use std::sync::Arc;
//! use strand_ioc::{Container, Lifetime};
//!
//! let root = Container::new();
//! root.add_singleton(|_| Ok(String::from("hello"))).unwrap();
//! let value: Option<Arc<String>> = root.resolve().unwrap();
//! assert_eq!(value.as_deref().map(String::as_str), Some("hello"));
//! # let _ = Lifetime::Scoped;
//! ```

pub mod container;
pub mod error;
pub mod key;
pub mod lifetime;
pub mod registration;

pub use container::{Container, ContainerId, Resolver, WeakContainer};
pub use error::{ContainerError, Fault};
pub use key::{Instance, ServiceKey, TypeKey, downcast, erase};
pub use lifetime::Lifetime;
pub use registration::{
    Arguments, Constructor, Dispose, Injectable, OpenGenericRealizer, Registration, Source,
};
