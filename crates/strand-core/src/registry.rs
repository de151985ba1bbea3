//! # InterceptionRegistry：拦截注册表
//!
//! ## 核心意图（Why）
//! - 作为宿主适配层的唯一入口：声明契约与方法、在任意作用域添加通知、设置实现工厂、注册代理；
//! - 按方法键缓存已构建的管线，并以“代次”判断缓存是否过期。
//!
//! ## 行为契约（What）
//! - 任何通过注册表 API 进行的通知注册、实现变更、作用域写入与配置覆盖都会递增代次；
//!   下一次解析该方法时重建，已开始的调用继续使用旧管线；
//! - 直接在 [`ConfigurationScope`] 上写值不会递增代次，需要随后调用 [`InterceptionRegistry::invalidate`]；
//! - 实现实例以闭合泛型键 `strand.implementation<契约>` 注册在容器中，代理构造时在当前容器中解析；
//! - 管线缓存跟随容器作用域：根容器一份，子作用域各一份（以 `Scoped` 服务挂在容器上）。
//!   代理在哪个作用域构造，它的通知就从哪个作用域解析，`Scoped` 通知因此每个作用域一个实例。
//!
//! ## 风险提示（Trade-offs）
//! - 单例代理持有注册表的强引用，而注册表的容器又缓存着该代理，二者形成引用环；
//!   注册表与根容器本就与进程同寿，这一环不会造成实际泄漏。

use std::{
    fmt,
    marker::PhantomData,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::RwLock;
use strand_ioc::{
    Container, ContainerError, Instance, Lifetime, Registration, Resolver, ServiceKey, TypeKey,
    downcast,
};
use tracing::{debug, warn};

use crate::{
    advice::{AdviceOrdering, AdviceRegistration, AdviceType, Pointcut},
    configuration::scope::{ConfigurationScope, ScopeTree, module_name_of},
    dispatch::{
        arguments::{MethodArguments, MethodInvoker},
        dispatcher::Dispatcher,
        implementation::ImplementationDispatch,
        result::ReturnValue,
    },
    error::{ConfigurationError, DispatchError, Fault, PipelineError},
    method::{MethodDescriptor, MethodKey},
    pipeline::{
        MethodInvocationConfiguration,
        builder::{self, BuildInput},
    },
};

/// 实现实例所在的开放泛型族名。
pub const IMPLEMENTATION_FAMILY: &str = "strand.implementation";

/// 契约 `C` 的实现实例在容器中的服务键。
pub fn implementation_key(contract: TypeKey) -> ServiceKey {
    ServiceKey::generic(IMPLEMENTATION_FAMILY, vec![contract])
}

pub(crate) struct MethodRecord {
    descriptor: Arc<MethodDescriptor>,
    scope: Arc<ConfigurationScope>,
    invoker: RwLock<Option<MethodInvoker>>,
}

/// 一个容器作用域内已构建的管线。
#[derive(Default)]
pub(crate) struct PipelineCache {
    configurations: DashMap<MethodKey, Arc<MethodInvocationConfiguration>>,
}

pub(crate) struct RegistryInner {
    container: Container,
    scopes: ScopeTree,
    methods: DashMap<MethodKey, Arc<MethodRecord>>,
    method_index: DashMap<(TypeKey, &'static str), MethodKey>,
    configurations: PipelineCache,
    generation: AtomicU64,
    next_method: AtomicU32,
    sequence: AtomicU64,
}

/// 拦截注册表句柄，克隆成本为一次引用计数递增。
///
/// # 教案式说明
/// - **意图 (Why)**：把配置树、服务容器与管线缓存组合为一个可共享对象，代理经由它完成每次调用；
/// - **契约 (What)**：全部方法都可并发调用；
/// - **设计权衡 (Trade-offs)**：管线缓存以 `DashMap` 保存，并发首次构建可能重复构建一次，
///   结果等价，后写入者覆盖先写入者。
#[derive(Clone)]
pub struct InterceptionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for InterceptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptionRegistry {
    /// 以新的根容器创建注册表。
    pub fn new() -> Self {
        Self::with_container(Container::new())
    }

    /// 以给定的根容器创建注册表。
    pub fn with_container(container: Container) -> Self {
        if let Err(error) = container.add_scoped(|_| Ok(PipelineCache::default())) {
            warn!(container = %container.id(), error = %error, "scoped pipeline cache not registered");
        }
        Self {
            inner: Arc::new(RegistryInner {
                container,
                scopes: ScopeTree::new(),
                methods: DashMap::new(),
                method_index: DashMap::new(),
                configurations: PipelineCache::default(),
                generation: AtomicU64::new(1),
                next_method: AtomicU32::new(1),
                sequence: AtomicU64::new(1),
            }),
        }
    }

    /// 根容器。
    pub fn container(&self) -> &Container {
        &self.inner.container
    }

    /// 配置树。
    pub fn scopes(&self) -> &ScopeTree {
        &self.inner.scopes
    }

    /// 全局作用域。
    pub fn global(&self) -> &Arc<ConfigurationScope> {
        self.inner.scopes.global()
    }

    /// 获取或创建模块作用域。
    pub fn module(&self, name: &str) -> Result<Arc<ConfigurationScope>, ConfigurationError> {
        self.inner.scopes.module(name)
    }

    /// 当前代次。
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// 使全部已构建管线过期。
    pub fn invalidate(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, "interception registry invalidated");
    }

    /// 在推导出的模块下配置契约 `C`。
    pub fn configure_contract<C: ?Sized + 'static>(
        &self,
    ) -> Result<ContractConfigurator<C>, ConfigurationError> {
        self.configure_contract_in::<C>(module_name_of(std::any::type_name::<C>()))
    }

    /// 在指定模块下配置契约 `C`。
    pub fn configure_contract_in<C: ?Sized + 'static>(
        &self,
        module: &str,
    ) -> Result<ContractConfigurator<C>, ConfigurationError> {
        let contract = TypeKey::of::<C>();
        let scope = match self.inner.scopes.find_contract(contract.name()) {
            Some(scope) => scope,
            None => self.inner.scopes.contract(module, contract.name())?,
        };
        Ok(ContractConfigurator {
            registry: self.clone(),
            scope,
            _contract: PhantomData,
        })
    }

    /// 契约 `C` 的作用域（已配置时）。
    pub fn contract_scope<C: ?Sized + 'static>(&self) -> Option<Arc<ConfigurationScope>> {
        self.inner.scopes.find_contract(std::any::type_name::<C>())
    }

    /// 声明方法；同一契约下的同名方法重复声明时更新描述与调用器并沿用原方法键。
    pub fn configure_method(
        &self,
        descriptor: MethodDescriptor,
        invoker: Option<MethodInvoker>,
    ) -> Result<MethodKey, PipelineError> {
        let contract = descriptor.contract();
        let contract_scope = self.inner.scopes.contract_by_name(contract.name())?;
        let scope = self.inner.scopes.method(&contract_scope, descriptor.name())?;
        let descriptor = Arc::new(descriptor);
        let record = Arc::new(MethodRecord {
            descriptor: Arc::clone(&descriptor),
            scope,
            invoker: RwLock::new(invoker),
        });

        let key = match self.inner.method_index.entry((contract, descriptor.name())) {
            Entry::Occupied(occupied) => *occupied.get(),
            Entry::Vacant(vacant) => {
                let key = MethodKey::new(self.inner.next_method.fetch_add(1, Ordering::Relaxed));
                vacant.insert(key);
                key
            }
        };
        self.inner.methods.insert(key, record);
        debug!(method = %descriptor.qualified_name(), key = %key, "method configured");
        self.invalidate();
        Ok(key)
    }

    /// 按契约与方法名查找方法键。
    pub fn method_key(&self, contract: TypeKey, name: &str) -> Option<MethodKey> {
        self.inner
            .method_index
            .iter()
            .find(|entry| entry.key().0 == contract && entry.key().1 == name)
            .map(|entry| *entry.value())
    }

    /// 方法描述符。
    pub fn descriptor(&self, key: MethodKey) -> Option<Arc<MethodDescriptor>> {
        self.inner
            .methods
            .get(&key)
            .map(|record| Arc::clone(&record.descriptor))
    }

    /// 方法作用域。
    pub fn method_scope(&self, key: MethodKey) -> Option<Arc<ConfigurationScope>> {
        self.inner
            .methods
            .get(&key)
            .map(|record| Arc::clone(&record.scope))
    }

    /// 在任意作用域添加通知。
    pub fn add_advice(
        &self,
        scope: &Arc<ConfigurationScope>,
        advice: AdviceType,
        pointcut: Pointcut,
        ordering: AdviceOrdering,
    ) -> Result<(), ConfigurationError> {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        debug!(scope = %scope.path(), advice = %advice.id(), sequence, "advice registered");
        scope.add_advice(AdviceRegistration::new(advice, pointcut, ordering, sequence))?;
        self.invalidate();
        Ok(())
    }

    /// 设置契约 `C` 的实现工厂，并在契约作用域登记实现分发步骤。
    pub fn set_implementation_factory<C, F>(
        &self,
        lifetime: Lifetime,
        factory: F,
    ) -> Result<(), PipelineError>
    where
        C: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<Arc<C>, ContainerError> + Send + Sync + 'static,
    {
        let contract = TypeKey::of::<C>();
        self.inner.container.register(
            Registration::factory::<C, _>(lifetime, factory).keyed(implementation_key(contract)),
        )?;
        let scope = self.configure_contract::<C>()?.scope;
        let declared = scope
            .advices()
            .iter()
            .any(|registration| registration.id().is_implementation_dispatch());
        if !declared {
            self.add_advice(
                &scope,
                ImplementationDispatch::advice_type(),
                Pointcut::all(),
                AdviceOrdering::new(),
            )?;
        } else {
            self.invalidate();
        }
        Ok(())
    }

    /// 注册契约 `C` 的代理：容器解析 `C` 时以 `generator` 包装一个新的 [`Dispatcher`]。
    ///
    /// 每个生命周期槽位对应一个代理实例，也就对应一份代理级存储。
    pub fn register_proxy<C, G>(&self, lifetime: Lifetime, generator: G) -> Result<(), ContainerError>
    where
        C: ?Sized + Send + Sync + 'static,
        G: Fn(Dispatcher) -> Arc<C> + Send + Sync + 'static,
    {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let contract = TypeKey::of::<C>();
        self.inner.container.register(Registration::factory::<C, _>(
            lifetime,
            move |resolver| {
                let inner = registry.upgrade().ok_or_else(|| ContainerError::Missing {
                    service: String::from("strand interception registry"),
                })?;
                let target = resolver.resolve_key(&implementation_key(contract))?;
                let dispatcher = Dispatcher::new(
                    InterceptionRegistry { inner },
                    contract,
                    target,
                    Some(resolver.container().downgrade()),
                );
                Ok(generator(dispatcher))
            },
        ))
    }

    /// 在作用域写值并使管线过期。
    pub fn set_value<T: Send + Sync + 'static>(
        &self,
        scope: &Arc<ConfigurationScope>,
        key: impl Into<String>,
        value: T,
        write_to_ancestors: bool,
    ) {
        scope.set_value(key, value, write_to_ancestors);
        self.invalidate();
    }

    /// 应用 TOML 配置覆盖并使管线过期。
    pub fn apply_toml(&self, text: &str) -> Result<(), ConfigurationError> {
        let result = self.inner.scopes.apply_toml(text);
        self.invalidate();
        result
    }

    /// 解析方法的管线：命中当前代次的缓存时直接返回，否则重建。通知实例从根容器解析。
    pub fn invocation_configuration(
        &self,
        key: MethodKey,
    ) -> Result<Arc<MethodInvocationConfiguration>, PipelineError> {
        self.cached_configuration(key, &self.inner.container, &self.inner.configurations)
    }

    /// 在容器作用域 `scope` 中解析方法的管线。
    ///
    /// 通知实例从 `scope` 解析，缓存随 `scope` 一同释放；`scope` 为根容器时等同于
    /// [`invocation_configuration`](Self::invocation_configuration)。
    pub fn invocation_configuration_in(
        &self,
        key: MethodKey,
        scope: &Container,
    ) -> Result<Arc<MethodInvocationConfiguration>, PipelineError> {
        if scope.id() == self.inner.container.id() {
            return self.invocation_configuration(key);
        }
        let cache = scope.get_required::<PipelineCache>()?;
        self.cached_configuration(key, scope, &cache)
    }

    fn cached_configuration(
        &self,
        key: MethodKey,
        container: &Container,
        cache: &PipelineCache,
    ) -> Result<Arc<MethodInvocationConfiguration>, PipelineError> {
        let generation = self.generation();
        if let Some(cached) = cache.configurations.get(&key) {
            if cached.generation() == generation {
                return Ok(Arc::clone(cached.value()));
            }
        }

        let record = self
            .inner
            .methods
            .get(&key)
            .map(|record| Arc::clone(record.value()))
            .ok_or_else(|| PipelineError::UnknownMethod {
                method: key.to_string(),
            })?;
        let built = Arc::new(builder::build(BuildInput {
            key,
            descriptor: &record.descriptor,
            scope: &record.scope,
            invoker: record.invoker.read().clone(),
            container,
            generation,
        })?);
        cache.configurations.insert(key, Arc::clone(&built));
        Ok(built)
    }

    /// 构建全部已声明方法的管线，遇到第一个错误即返回。
    pub fn build_all(&self) -> Result<(), PipelineError> {
        let mut keys: Vec<MethodKey> = self.inner.methods.iter().map(|entry| *entry.key()).collect();
        keys.sort();
        for key in keys {
            self.invocation_configuration(key)?;
        }
        Ok(())
    }

    /// 为契约 `C` 创建不经过容器的分发器，实现实例由调用方直接给出。
    pub fn dispatcher_for<C>(&self, target: Option<Arc<C>>) -> Dispatcher
    where
        C: ?Sized + Send + Sync + 'static,
    {
        Dispatcher::new(
            self.clone(),
            TypeKey::of::<C>(),
            target.map(strand_ioc::erase),
            None,
        )
    }
}

impl fmt::Debug for InterceptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptionRegistry")
            .field("methods", &self.inner.methods.len())
            .field("generation", &self.generation())
            .field("container", &self.inner.container)
            .finish()
    }
}

/// 契约级配置入口。
///
/// ```rust
/// use std::sync::Arc;
/// use strand_core::{InterceptionRegistry, MethodDescriptor, ReturnValue};
///
/// trait Greeter: Send + Sync {
///     fn greet(&self, name: String) -> String;
/// }
///
/// let registry = InterceptionRegistry::new();
/// let greeter = registry.configure_contract::<dyn Greeter>().unwrap();
/// let greet = greeter
///     .method(
///         MethodDescriptor::new::<dyn Greeter>("greet")
///             .param::<String>("name")
///             .returns::<String>(),
///         |target, arguments| {
///             let name = arguments.cloned::<String>(0)?;
///             Ok(ReturnValue::ready(target.greet(name)))
///         },
///     )
///     .unwrap();
/// assert_eq!(registry.descriptor(greet).unwrap().name(), "greet");
/// ```
pub struct ContractConfigurator<C: ?Sized> {
    registry: InterceptionRegistry,
    scope: Arc<ConfigurationScope>,
    _contract: PhantomData<fn() -> Box<C>>,
}

impl<C: ?Sized + Send + Sync + 'static> ContractConfigurator<C> {
    /// 契约作用域。
    pub fn scope(&self) -> &Arc<ConfigurationScope> {
        &self.scope
    }

    /// 声明方法并给出类型化调用器。
    pub fn method<F>(&self, descriptor: MethodDescriptor, invoker: F) -> Result<MethodKey, PipelineError>
    where
        F: Fn(Arc<C>, &mut MethodArguments<'_>) -> Result<ReturnValue, Fault> + Send + Sync + 'static,
    {
        let method = descriptor.qualified_name();
        let erased: MethodInvoker = Arc::new(move |target: &Instance, arguments: &mut MethodArguments<'_>| {
            let target = downcast::<C>(target).ok_or_else(|| {
                Fault::from(DispatchError::NoImplementation {
                    method: method.clone(),
                })
            })?;
            invoker(target, arguments)
        });
        self.registry
            .configure_method(self.bind(descriptor), Some(erased))
    }

    /// 只声明方法，不提供调用器（管线必须由通知自行产出结果）。
    pub fn declare(&self, descriptor: MethodDescriptor) -> Result<MethodKey, PipelineError> {
        self.registry.configure_method(self.bind(descriptor), None)
    }

    fn bind(&self, descriptor: MethodDescriptor) -> MethodDescriptor {
        descriptor.rebind(TypeKey::of::<C>())
    }

    /// 在契约作用域添加通知。
    pub fn add_advice(
        &self,
        advice: AdviceType,
        pointcut: Pointcut,
        ordering: AdviceOrdering,
    ) -> Result<(), ConfigurationError> {
        self.registry.add_advice(&self.scope, advice, pointcut, ordering)
    }

    /// 设置实现工厂。
    pub fn implementation_factory<F>(&self, lifetime: Lifetime, factory: F) -> Result<(), PipelineError>
    where
        F: Fn(&Resolver<'_>) -> Result<Arc<C>, ContainerError> + Send + Sync + 'static,
    {
        self.registry.set_implementation_factory::<C, F>(lifetime, factory)
    }

    /// 方法作用域。
    pub fn method_scope(&self, name: &str) -> Option<Arc<ConfigurationScope>> {
        self.scope.find_child(name)
    }
}
