//! # key 模块说明
//!
//! ## 角色定位（Why）
//! - 容器以 [`ServiceKey`] 为索引保存注册，既要支持具体类型（含 `dyn Trait`），
//!   也要支持“族名 + 类型参数”形式的闭合泛型，以承载开放泛型的实化结果；
//! - 实例统一擦除为 [`Instance`]，使同一张表可以存放任意服务。
//!
//! ## 设计要求（What）
//! - [`TypeKey`] 的相等与哈希只依赖 `TypeId`，名称仅用于诊断；
//! - [`Instance`] 内部总是包着一个 `Arc<T>`，这样 `T` 可以是 `dyn Trait` 这类非 `Sized` 类型；
//!   [`erase`] 与 [`downcast`] 是唯一的装箱/拆箱入口。

use std::{
    any::{Any, TypeId},
    borrow::Cow,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// 类型擦除后的服务实例。
///
/// 约定：内部值的具体类型总是 `Arc<T>`，其中 `T` 为注册时声明的服务类型。
pub type Instance = Arc<dyn Any + Send + Sync>;

/// 将 `Arc<T>` 擦除为 [`Instance`]。
pub fn erase<T>(value: Arc<T>) -> Instance
where
    T: ?Sized + Send + Sync + 'static,
{
    Arc::new(value)
}

/// 从 [`Instance`] 中取回 `Arc<T>`；类型不符时返回 `None`。
pub fn downcast<T>(instance: &Instance) -> Option<Arc<T>>
where
    T: ?Sized + Send + Sync + 'static,
{
    instance.downcast_ref::<Arc<T>>().cloned()
}

/// 带名称的类型标识。
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// 获取 `T` 的类型标识。
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// 底层 `TypeId`。
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// 编译器给出的类型名，仅用于诊断与配置作用域命名。
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 是否与 `T` 为同一类型。
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// 服务键。
///
/// # 教案式说明
/// - **意图 (Why)**：Rust 没有运行期泛型定义，开放泛型以“族名”表示，
///   闭合泛型即“族名 + 有序类型参数”；
/// - **契约 (What)**：`Type` 对应一个具体类型；`Generic` 的相等性由族名与参数序列共同决定；
/// - **设计权衡 (Trade-offs)**：参数以 `Arc<[TypeKey]>` 保存，克隆成本恒定，
///   代价是构造时的一次分配。
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    /// 具体类型。
    Type(TypeKey),
    /// 开放泛型族的一个闭合实例。
    Generic {
        family: Cow<'static, str>,
        arguments: Arc<[TypeKey]>,
    },
}

impl ServiceKey {
    /// 具体类型 `T` 的服务键。
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self::Type(TypeKey::of::<T>())
    }

    /// 闭合泛型服务键。
    pub fn generic(family: impl Into<Cow<'static, str>>, arguments: impl Into<Arc<[TypeKey]>>) -> Self {
        Self::Generic {
            family: family.into(),
            arguments: arguments.into(),
        }
    }

    /// 闭合泛型所属的族名；具体类型返回 `None`。
    pub fn family(&self) -> Option<&str> {
        match self {
            Self::Type(_) => None,
            Self::Generic { family, .. } => Some(family.as_ref()),
        }
    }

    /// 闭合泛型的类型参数；具体类型返回空切片。
    pub fn arguments(&self) -> &[TypeKey] {
        match self {
            Self::Type(_) => &[],
            Self::Generic { arguments, .. } => arguments,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(key) => f.write_str(key.name()),
            Self::Generic { family, arguments } => {
                write!(f, "{family}<")?;
                for (index, argument) in arguments.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(argument.name())?;
                }
                f.write_str(">")
            }
        }
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
