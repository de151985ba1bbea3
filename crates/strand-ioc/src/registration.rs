//! # registration 模块说明
//!
//! ## 角色定位（Why）
//! - 描述“某个服务键如何被满足”：工厂闭包、实现类型的构造函数集合、固定实例，
//!   或表示“明确不存在”的哨兵；
//! - 同时携带生命周期与可选的释放钩子，容器据此决定缓存位置与释放顺序。
//!
//! ## 行为契约（What）
//! - [`Registration`] 可克隆，克隆后的注册共享同一组闭包（`Arc`），
//!   作用域注册被子容器“收养”时即依赖这一点；
//! - [`Constructor`] 以显式参数列表声明依赖，容器在解析前即可判断其是否可满足。
//!
//! ## 风险提示（Trade-offs）
//! - 没有运行期反射，实现类型需手写 [`Injectable::constructors`]；
//!   换来的好处是依赖关系在编译期即被类型系统检查。

use std::{fmt, sync::Arc};

use crate::{
    container::Resolver,
    error::ContainerError,
    key::{Instance, ServiceKey, TypeKey, downcast, erase},
    lifetime::Lifetime,
};

/// 释放钩子。
///
/// 实现者在所属容器 `dispose()` 时被调用一次，调用顺序与注册顺序相反。
pub trait Dispose: Send + Sync {
    /// 释放持有的资源。
    fn dispose(&self);
}

/// 可由容器按构造函数自动装配的实现类型。
///
/// # 教案式说明
/// - **意图 (Why)**：模拟“选择参数最多且全部可解析的构造函数”的装配策略；
/// - **契约 (What)**：返回的构造函数集合顺序无关，容器会按参数个数降序尝试；
/// - **风险 (Trade-offs)**：参数个数相同的构造函数按声明顺序优先。
pub trait Injectable: Send + Sync + Sized + 'static {
    /// 列出全部候选构造函数。
    fn constructors() -> Vec<Constructor<Self>>;
}

/// 工厂闭包：基于解析器产出擦除实例。
pub type FactoryFn = Arc<dyn Fn(&Resolver<'_>) -> Result<Instance, ContainerError> + Send + Sync>;

/// 释放闭包：接收缓存中的擦除实例。
pub type Disposer = Arc<dyn Fn(&Instance) + Send + Sync>;

/// 开放泛型实化器：给定类型参数返回闭合注册。
pub type OpenGenericRealizer =
    Arc<dyn Fn(&[TypeKey]) -> Result<Registration, ContainerError> + Send + Sync>;

type BuildFn<T> = Arc<dyn Fn(&mut Arguments) -> Result<T, ContainerError> + Send + Sync>;

/// 构造函数在被容器选中后收到的已解析参数。
///
/// 参数按 [`Constructor::param`] 的声明顺序排列，[`Arguments::next`] 依次取出。
pub struct Arguments {
    values: Vec<(ServiceKey, Instance)>,
    position: usize,
}

impl Arguments {
    pub(crate) fn new(values: Vec<(ServiceKey, Instance)>) -> Self {
        Self {
            values,
            position: 0,
        }
    }

    /// 取出下一个参数，并还原为声明时的类型。
    pub fn next<P>(&mut self) -> Result<Arc<P>, ContainerError>
    where
        P: ?Sized + Send + Sync + 'static,
    {
        let Some((key, instance)) = self.values.get(self.position) else {
            return Err(ContainerError::Missing {
                service: TypeKey::of::<P>().name().to_owned(),
            });
        };
        self.position += 1;
        downcast::<P>(instance).ok_or_else(|| ContainerError::TypeMismatch {
            service: key.to_string(),
        })
    }

    /// 剩余参数个数。
    pub fn remaining(&self) -> usize {
        self.values.len().saturating_sub(self.position)
    }
}

/// 实现类型的一个构造函数。
pub struct Constructor<T> {
    parameters: Vec<ServiceKey>,
    build: BuildFn<T>,
}

impl<T: 'static> Constructor<T> {
    /// 以构建闭包创建构造函数，参数随后通过 [`Constructor::param`] 声明。
    pub fn build<F>(build: F) -> Self
    where
        F: Fn(&mut Arguments) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        Self {
            parameters: Vec::new(),
            build: Arc::new(build),
        }
    }

    /// 追加一个依赖参数。
    pub fn param<P: ?Sized + 'static>(mut self) -> Self {
        self.parameters.push(ServiceKey::of::<P>());
        self
    }

    /// 追加一个以任意服务键表示的依赖参数。
    pub fn param_key(mut self, key: ServiceKey) -> Self {
        self.parameters.push(key);
        self
    }

    /// 已声明的参数。
    pub fn parameters(&self) -> &[ServiceKey] {
        &self.parameters
    }
}

/// 类型擦除后的构造函数。
#[derive(Clone)]
pub struct ErasedConstructor {
    pub(crate) parameters: Vec<ServiceKey>,
    pub(crate) build: BuildFn<Instance>,
}

impl ErasedConstructor {
    /// 参数个数。
    pub fn arity(&self) -> usize {
        self.parameters.len()
    }
}

/// 注册的实现来源。
#[derive(Clone)]
pub enum Source {
    /// 工厂闭包。
    Factory(FactoryFn),
    /// 实现类型的构造函数集合。
    Constructors {
        implementation: &'static str,
        constructors: Vec<ErasedConstructor>,
    },
    /// 预先构造好的实例。
    Instance(Instance),
    /// 明确不存在：解析结果为 `None`。
    Nonexisting,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Factory(_) => f.write_str("Factory"),
            Self::Constructors {
                implementation,
                constructors,
            } => f
                .debug_struct("Constructors")
                .field("implementation", implementation)
                .field("count", &constructors.len())
                .finish(),
            Self::Instance(_) => f.write_str("Instance"),
            Self::Nonexisting => f.write_str("Nonexisting"),
        }
    }
}

/// 一条服务注册。
///
/// # 教案式说明
/// - **意图 (Why)**：把“键、生命周期、来源、释放钩子”打包为不可变描述，容器只需保存并克隆它；
/// - **契约 (What)**：
///   - 类型化构造器（[`Registration::factory`]、[`Registration::implementation`] 等）
///     自动以服务类型生成键，[`Registration::keyed`] 可改写为任意键（如闭合泛型）；
///   - 释放钩子只对容器缓存的实例生效，瞬态实例与固定实例不被追踪；
/// - **设计权衡 (Trade-offs)**：来源以枚举表达，便于在诊断中区分“构造不出”与“明确不存在”。
#[derive(Clone)]
pub struct Registration {
    key: ServiceKey,
    lifetime: Lifetime,
    source: Source,
    disposer: Option<Disposer>,
}

impl Registration {
    /// 以擦除工厂创建注册。
    pub fn erased<F>(key: ServiceKey, lifetime: Lifetime, factory: F) -> Self
    where
        F: Fn(&Resolver<'_>) -> Result<Instance, ContainerError> + Send + Sync + 'static,
    {
        Self {
            key,
            lifetime,
            source: Source::Factory(Arc::new(factory)),
            disposer: None,
        }
    }

    /// 以类型化工厂创建注册，服务类型 `T` 可以是 `dyn Trait`。
    pub fn factory<T, F>(lifetime: Lifetime, factory: F) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<Arc<T>, ContainerError> + Send + Sync + 'static,
    {
        Self::erased(ServiceKey::of::<T>(), lifetime, move |resolver| {
            factory(resolver).map(erase)
        })
    }

    /// 注册固定实例；生命周期视为单例。
    pub fn instance<T>(value: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            key: ServiceKey::of::<T>(),
            lifetime: Lifetime::Singleton,
            source: Source::Instance(erase(value)),
            disposer: None,
        }
    }

    /// 注册“明确不存在”的哨兵。
    pub fn nonexisting(key: ServiceKey) -> Self {
        Self {
            key,
            lifetime: Lifetime::Transient,
            source: Source::Nonexisting,
            disposer: None,
        }
    }

    /// 以实现类型 `I` 的构造函数集合满足服务 `S`，`cast` 负责向服务类型的转换。
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use strand_ioc::{Constructor, Container, Injectable, Lifetime, Registration};
    ///
    /// trait Clock: Send + Sync {
    ///     fn now(&self) -> u64;
    /// }
    ///
    /// struct Fixed;
    /// impl Clock for Fixed {
    ///     fn now(&self) -> u64 { 42 }
    /// }
    /// impl Injectable for Fixed {
    ///     fn constructors() -> Vec<Constructor<Self>> {
    ///         vec![Constructor::build(|_| Ok(Fixed))]
    ///     }
    /// }
    ///
    /// let root = Container::new();
    /// root.register(Registration::implementation::<dyn Clock, Fixed>(
    ///     Lifetime::Singleton,
    ///     |fixed| fixed,
    /// ))
    /// .unwrap();
    /// let clock = root.get_required::<dyn Clock>().unwrap();
    /// assert_eq!(clock.now(), 42);
    /// ```
    pub fn implementation<S, I>(lifetime: Lifetime, cast: fn(Arc<I>) -> Arc<S>) -> Self
    where
        S: ?Sized + Send + Sync + 'static,
        I: Injectable,
    {
        let constructors = I::constructors()
            .into_iter()
            .map(|constructor| {
                let build = constructor.build;
                ErasedConstructor {
                    parameters: constructor.parameters,
                    build: Arc::new(move |arguments: &mut Arguments| {
                        let value = build(arguments)?;
                        Ok(erase(cast(Arc::new(value))))
                    }),
                }
            })
            .collect();
        Self {
            key: ServiceKey::of::<S>(),
            lifetime,
            source: Source::Constructors {
                implementation: std::any::type_name::<I>(),
                constructors,
            },
            disposer: None,
        }
    }

    /// 以实现类型自身作为服务类型。
    pub fn of_type<I: Injectable>(lifetime: Lifetime) -> Self {
        Self::implementation::<I, I>(lifetime, |value| value)
    }

    /// 改写服务键。
    pub fn keyed(mut self, key: ServiceKey) -> Self {
        self.key = key;
        self
    }

    /// 实例缓存后由所属容器在释放时调用 [`Dispose::dispose`]。
    pub fn with_disposal<T>(self) -> Self
    where
        T: ?Sized + Dispose + Send + Sync + 'static,
    {
        self.on_dispose(|instance| {
            if let Some(value) = downcast::<T>(instance) {
                value.dispose();
            }
        })
    }

    /// 注册任意释放闭包。
    pub fn on_dispose<F>(mut self, disposer: F) -> Self
    where
        F: Fn(&Instance) + Send + Sync + 'static,
    {
        self.disposer = Some(Arc::new(disposer));
        self
    }

    /// 服务键。
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// 生命周期。
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// 实现来源。
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// 是否为“明确不存在”的哨兵。
    pub fn is_nonexisting(&self) -> bool {
        matches!(self.source, Source::Nonexisting)
    }

    pub(crate) fn disposer(&self) -> Option<&Disposer> {
        self.disposer.as_ref()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .field("source", &self.source)
            .field("disposable", &self.disposer.is_some())
            .finish()
    }
}
