//! # Container：分层服务容器
//!
//! ## 核心意图（Why）
//! - 以父子链组织容器：根容器承载单例，子作用域承载作用域实例，瞬态实例从不缓存；
//! - 支持开放泛型族的惰性实化，实化结果作为闭合注册缓存在声明族的容器中；
//! - 供拦截管线按方法解析通知实例，要求解析路径在高并发下无全局锁。
//!
//! ## 行为契约（What）
//! - 查找：从发起解析的容器（下称“顶层容器”）出发逐级向上；
//!   闭合泛型键在每一级先查已实化条目，再查开放泛型族；
//!   在祖先中找到的 `Scoped` 注册会被克隆进顶层容器，使实例扎根于当前作用域；
//!   全链均无注册时返回 `Ok(None)`（即“不存在”哨兵语义）；
//! - 激活：`Singleton` 在声明容器内、于条目锁保护下至多构造一次，其依赖也从声明容器解析；
//!   `Scoped` 缓存在顶层容器；`Transient` 每次构造；
//! - 释放：带释放钩子的缓存实例由其所属容器追踪，`dispose()` 按注册顺序逆序释放；
//!   已释放的容器拒绝解析与注册。
//!
//! ## 风险提示（Trade-offs）
//! - 单例构造持有条目锁，若两个线程以相反顺序构造互相依赖的单例会互相等待；
//!   这种依赖本身就是循环依赖，同一线程内会被路径检测报告。

use std::{
    borrow::Cow,
    cell::RefCell,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry as MapEntry};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    error::ContainerError,
    key::{Instance, ServiceKey, TypeKey, downcast, erase},
    lifetime::Lifetime,
    registration::{Arguments, Disposer, OpenGenericRealizer, Registration, Source},
};

static NEXT_CONTAINER: AtomicU64 = AtomicU64::new(1);
static NEXT_REGISTRATION: AtomicU64 = AtomicU64::new(1);

/// 容器标识，仅用于诊断。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContainerId(u64);

impl ContainerId {
    /// 数值形式。
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 容器中的一个条目：注册描述加上它的实例缓存。
struct Entry {
    registration: Arc<Registration>,
    owner: Weak<ContainerInner>,
    sequence: u64,
    cache: Mutex<Option<Instance>>,
}

impl Entry {
    fn new(registration: Arc<Registration>, owner: &Arc<ContainerInner>, sequence: u64) -> Self {
        Self {
            registration,
            owner: Arc::downgrade(owner),
            sequence,
            cache: Mutex::new(None),
        }
    }
}

/// 需要在释放时处理的实例。
struct Tracked {
    sequence: u64,
    service: String,
    instance: Instance,
    disposer: Disposer,
}

struct ContainerInner {
    id: ContainerId,
    parent: Option<Container>,
    entries: DashMap<ServiceKey, Arc<Entry>>,
    open_generics: DashMap<Cow<'static, str>, OpenGenericRealizer>,
    tracked: Mutex<Vec<Tracked>>,
    disposed: AtomicBool,
}

/// 分层服务容器句柄，克隆成本为一次引用计数递增。
///
/// # 教案式说明
/// - **意图 (Why)**：统一承载注册、解析、子作用域创建与释放；
/// - **契约 (What)**：同一容器可被多线程共享；子作用域持有父容器的强引用，
///   父容器不感知子作用域，子作用域需由创建者自行释放；
/// - **设计权衡 (Trade-offs)**：注册表使用 `DashMap`，读多写少的解析路径只触及分片读锁。
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    /// 创建根容器。
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Container>) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                id: ContainerId(NEXT_CONTAINER.fetch_add(1, Ordering::Relaxed)),
                parent,
                entries: DashMap::new(),
                open_generics: DashMap::new(),
                tracked: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// 容器标识。
    pub fn id(&self) -> ContainerId {
        self.inner.id
    }

    /// 不延长容器寿命的弱句柄。
    ///
    /// 缓存在容器内的实例若需回指所属容器，应持有弱句柄，否则容器与实例互相保活。
    pub fn downgrade(&self) -> WeakContainer {
        WeakContainer {
            id: self.id(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// 父容器。
    pub fn parent(&self) -> Option<&Container> {
        self.inner.parent.as_ref()
    }

    /// 创建子作用域。
    pub fn create_child_scope(&self) -> Container {
        let child = Self::with_parent(Some(self.clone()));
        debug!(parent = %self.id(), child = %child.id(), "child scope created");
        child
    }

    /// 是否已释放。
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> Result<(), ContainerError> {
        if self.is_disposed() {
            return Err(ContainerError::Disposed {
                container: self.id().get(),
            });
        }
        Ok(())
    }

    /// 写入注册；同键的已有注册被替换，其缓存实例随之失效。
    pub fn register(&self, registration: Registration) -> Result<(), ContainerError> {
        self.ensure_alive()?;
        let key = registration.key().clone();
        debug!(
            container = %self.id(),
            service = %key,
            lifetime = %registration.lifetime(),
            "service registered"
        );
        let entry = Entry::new(
            Arc::new(registration),
            &self.inner,
            NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed),
        );
        self.inner.entries.insert(key, Arc::new(entry));
        Ok(())
    }

    /// 注册开放泛型族；闭合键首次被请求时调用 `realizer` 生成注册并缓存。
    pub fn register_open_generic<F>(
        &self,
        family: impl Into<Cow<'static, str>>,
        realizer: F,
    ) -> Result<(), ContainerError>
    where
        F: Fn(&[TypeKey]) -> Result<Registration, ContainerError> + Send + Sync + 'static,
    {
        self.ensure_alive()?;
        let family = family.into();
        debug!(container = %self.id(), family = %family, "open generic registered");
        self.inner.open_generics.insert(family, Arc::new(realizer));
        Ok(())
    }

    /// 注册单例工厂。
    pub fn add_singleton<T, F>(&self, factory: F) -> Result<(), ContainerError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.add_typed(Lifetime::Singleton, factory)
    }

    /// 注册作用域工厂。
    pub fn add_scoped<T, F>(&self, factory: F) -> Result<(), ContainerError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.add_typed(Lifetime::Scoped, factory)
    }

    /// 注册瞬态工厂。
    pub fn add_transient<T, F>(&self, factory: F) -> Result<(), ContainerError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.add_typed(Lifetime::Transient, factory)
    }

    /// 注册固定实例。
    pub fn add_instance<T>(&self, value: Arc<T>) -> Result<(), ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.register(Registration::instance(value))
    }

    fn add_typed<T, F>(&self, lifetime: Lifetime, factory: F) -> Result<(), ContainerError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.register(Registration::factory::<T, _>(lifetime, move |resolver| {
            factory(resolver).map(Arc::new)
        }))
    }

    /// 服务 `T` 在容器链上是否可解析（不触发构造）。
    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.contains_key(&ServiceKey::of::<T>())
    }

    /// 服务键在容器链上是否可解析（不触发构造）。
    pub fn contains_key(&self, key: &ServiceKey) -> bool {
        let mut current = Some(self);
        while let Some(container) = current {
            if let Some(entry) = container.inner.entries.get(key) {
                return !entry.registration.is_nonexisting();
            }
            if let Some(family) = key.family() {
                if container.inner.open_generics.contains_key(family) {
                    return true;
                }
            }
            current = container.parent();
        }
        false
    }

    /// 解析服务 `T`；未注册时返回 `Ok(None)`。
    pub fn resolve<T>(&self) -> Result<Option<Arc<T>>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = ServiceKey::of::<T>();
        let path = RefCell::new(Vec::new());
        typed(&key, self.resolve_in(&key, &path)?)
    }

    /// 解析必需服务 `T`；未注册时返回 [`ContainerError::Missing`]。
    pub fn get_required<T>(&self) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.resolve::<T>()?.ok_or_else(|| ContainerError::Missing {
            service: TypeKey::of::<T>().name().to_owned(),
        })
    }

    /// 按服务键解析擦除实例。
    pub fn resolve_key(&self, key: &ServiceKey) -> Result<Option<Instance>, ContainerError> {
        let path = RefCell::new(Vec::new());
        self.resolve_in(key, &path)
    }

    fn resolve_in(
        &self,
        key: &ServiceKey,
        path: &RefCell<Vec<ServiceKey>>,
    ) -> Result<Option<Instance>, ContainerError> {
        self.ensure_alive()?;
        if path.borrow().contains(key) {
            let mut chain: Vec<String> = path.borrow().iter().map(ToString::to_string).collect();
            chain.push(key.to_string());
            return Err(ContainerError::CircularDependency {
                service: key.to_string(),
                path: chain,
            });
        }

        let Some(entry) = self.lookup(key)? else {
            trace!(container = %self.id(), service = %key, "service not registered");
            return Ok(None);
        };
        if entry.registration.is_nonexisting() {
            trace!(container = %self.id(), service = %key, "service registered as nonexisting");
            return Ok(None);
        }

        path.borrow_mut().push(key.clone());
        let activated = self.activate(&entry, path);
        path.borrow_mut().pop();
        trace!(container = %self.id(), service = %key, "service resolved");
        activated.map(Some)
    }

    /// 沿容器链查找条目，必要时实化开放泛型或收养作用域注册。
    fn lookup(&self, key: &ServiceKey) -> Result<Option<Arc<Entry>>, ContainerError> {
        let mut current = Some(self);
        while let Some(container) = current {
            let found = match container.inner.entries.get(key) {
                Some(entry) => Some(Arc::clone(entry.value())),
                None => container.realize(key)?,
            };
            if let Some(entry) = found {
                if container.id() != self.id()
                    && entry.registration.lifetime() == Lifetime::Scoped
                {
                    return Ok(Some(self.adopt(key, &entry)));
                }
                return Ok(Some(entry));
            }
            current = container.parent();
        }
        Ok(None)
    }

    fn realize(&self, key: &ServiceKey) -> Result<Option<Arc<Entry>>, ContainerError> {
        let Some(family) = key.family() else {
            return Ok(None);
        };
        let Some(realizer) = self
            .inner
            .open_generics
            .get(family)
            .map(|realizer| Arc::clone(realizer.value()))
        else {
            return Ok(None);
        };
        let registration = realizer(key.arguments())?.keyed(key.clone());
        debug!(container = %self.id(), service = %key, "open generic realized");
        let candidate = Arc::new(Entry::new(
            Arc::new(registration),
            &self.inner,
            NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed),
        ));
        let entry = match self.inner.entries.entry(key.clone()) {
            MapEntry::Occupied(occupied) => Arc::clone(occupied.get()),
            MapEntry::Vacant(vacant) => Arc::clone(vacant.insert(candidate).value()),
        };
        Ok(Some(entry))
    }

    fn adopt(&self, key: &ServiceKey, declared: &Arc<Entry>) -> Arc<Entry> {
        let candidate = Arc::new(Entry::new(
            Arc::clone(&declared.registration),
            &self.inner,
            declared.sequence,
        ));
        match self.inner.entries.entry(key.clone()) {
            MapEntry::Occupied(occupied) => Arc::clone(occupied.get()),
            MapEntry::Vacant(vacant) => {
                trace!(container = %self.id(), service = %key, "scoped registration adopted");
                Arc::clone(vacant.insert(candidate).value())
            }
        }
    }

    fn activate(
        &self,
        entry: &Arc<Entry>,
        path: &RefCell<Vec<ServiceKey>>,
    ) -> Result<Instance, ContainerError> {
        let registration = &entry.registration;
        if let Source::Instance(instance) = registration.source() {
            return Ok(Arc::clone(instance));
        }
        match registration.lifetime() {
            Lifetime::Transient => self.construct(registration, path),
            Lifetime::Singleton | Lifetime::Scoped => {
                let owner = entry
                    .owner
                    .upgrade()
                    .map(|inner| Container { inner })
                    .ok_or(ContainerError::Disposed {
                        container: self.id().get(),
                    })?;
                let mut cache = entry.cache.lock();
                if let Some(instance) = cache.as_ref() {
                    return Ok(Arc::clone(instance));
                }
                owner.ensure_alive()?;
                let instance = owner.construct(registration, path)?;
                *cache = Some(Arc::clone(&instance));
                if let Some(disposer) = registration.disposer() {
                    owner.inner.tracked.lock().push(Tracked {
                        sequence: entry.sequence,
                        service: registration.key().to_string(),
                        instance: Arc::clone(&instance),
                        disposer: Arc::clone(disposer),
                    });
                }
                Ok(instance)
            }
        }
    }

    fn construct(
        &self,
        registration: &Registration,
        path: &RefCell<Vec<ServiceKey>>,
    ) -> Result<Instance, ContainerError> {
        let resolver = Resolver {
            container: self,
            path,
        };
        match registration.source() {
            Source::Factory(factory) => factory(&resolver),
            Source::Instance(instance) => Ok(Arc::clone(instance)),
            Source::Nonexisting => Err(ContainerError::Missing {
                service: registration.key().to_string(),
            }),
            Source::Constructors {
                implementation,
                constructors,
            } => {
                let mut ordered: Vec<_> = constructors.iter().collect();
                ordered.sort_by(|a, b| b.arity().cmp(&a.arity()));
                let mut first_missing: Option<Vec<String>> = None;
                for constructor in ordered {
                    let missing: Vec<String> = constructor
                        .parameters
                        .iter()
                        .filter(|parameter| !self.contains_key(parameter))
                        .map(ToString::to_string)
                        .collect();
                    if missing.is_empty() {
                        let mut values = Vec::with_capacity(constructor.parameters.len());
                        for parameter in &constructor.parameters {
                            let value = resolver.resolve_key(parameter)?.ok_or_else(|| {
                                ContainerError::Missing {
                                    service: parameter.to_string(),
                                }
                            })?;
                            values.push((parameter.clone(), value));
                        }
                        trace!(
                            implementation = %implementation,
                            arity = constructor.arity(),
                            "constructor selected"
                        );
                        return (constructor.build)(&mut Arguments::new(values));
                    }
                    first_missing.get_or_insert(missing);
                }
                Err(ContainerError::NoResolvableConstructor {
                    implementation: (*implementation).to_owned(),
                    unresolved: first_missing.unwrap_or_default(),
                })
            }
        }
    }

    /// 释放容器：按注册顺序逆序调用被追踪实例的释放钩子。重复调用无副作用。
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tracked = std::mem::take(&mut *self.inner.tracked.lock());
        tracked.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        debug!(container = %self.id(), count = tracked.len(), "disposing container");
        for item in tracked {
            debug!(container = %self.id(), service = %item.service, "disposing instance");
            (item.disposer)(&item.instance);
        }
        for entry in self.inner.entries.iter() {
            entry.cache.lock().take();
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("parent", &self.parent().map(Container::id))
            .field("entries", &self.inner.entries.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn typed<T>(key: &ServiceKey, instance: Option<Instance>) -> Result<Option<Arc<T>>, ContainerError>
where
    T: ?Sized + Send + Sync + 'static,
{
    match instance {
        None => Ok(None),
        Some(instance) => downcast::<T>(&instance)
            .map(Some)
            .ok_or_else(|| ContainerError::TypeMismatch {
                service: key.to_string(),
            }),
    }
}
/// [`Container`] 的弱句柄。
#[derive(Clone)]
pub struct WeakContainer {
    id: ContainerId,
    inner: Weak<ContainerInner>,
}

impl WeakContainer {
    /// 被引用容器的标识，容器释放后仍可读取。
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// 容器仍存活时取回强句柄。
    pub fn upgrade(&self) -> Option<Container> {
        self.inner.upgrade().map(|inner| Container { inner })
    }
}

impl fmt::Debug for WeakContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakContainer")
            .field("id", &self.id)
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// 工厂闭包收到的解析器。
///
/// # 教案式说明
/// - **意图 (Why)**：让工厂在构造过程中继续解析依赖，同时携带当前解析路径以检测循环依赖；
/// - **契约 (What)**：解析器绑定的容器是“构造发生的容器”，对单例而言即声明容器；
/// - **风险 (Trade-offs)**：解析器不可跨线程传递，工厂应在调用期内完成所有依赖解析。
pub struct Resolver<'a> {
    container: &'a Container,
    path: &'a RefCell<Vec<ServiceKey>>,
}

impl<'a> Resolver<'a> {
    /// 构造发生的容器。
    pub fn container(&self) -> &'a Container {
        self.container
    }

    /// 解析服务 `T`。
    pub fn resolve<T>(&self) -> Result<Option<Arc<T>>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = ServiceKey::of::<T>();
        typed(&key, self.container.resolve_in(&key, self.path)?)
    }

    /// 解析必需服务 `T`。
    pub fn get_required<T>(&self) -> Result<Arc<T>, ContainerError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.resolve::<T>()?.ok_or_else(|| ContainerError::Missing {
            service: TypeKey::of::<T>().name().to_owned(),
        })
    }

    /// 按服务键解析。
    pub fn resolve_key(&self, key: &ServiceKey) -> Result<Option<Instance>, ContainerError> {
        self.container.resolve_in(key, self.path)
    }

    /// 包装一个值为擦除实例，便于擦除工厂返回。
    pub fn erase<T: Send + Sync + 'static>(&self, value: T) -> Instance {
        erase(Arc::new(value))
    }
}
