//! # shape 模块说明
//!
//! ## 角色定位（Why）
//! - 通知的配置以“形态”（shape）声明：一个稳定命名空间、若干具名设置与一个 `Enabled` 开关；
//! - 设置以 `"{namespace}.{setting}"` 为键写入作用域，不同形态互不冲突。
//!
//! ## 设计要求（What）
//! - [`ShapeId`] 描述形态元数据（默认启用、是否强制、依赖的其他形态），
//!   依赖以函数指针惰性展开，[`ShapeId::flatten`] 在展开时去重，形态互相依赖也能终止；
//! - [`AdviceConfig`] 是无类型视图，构建器用它评估 `Enabled`；
//!   [`ConfigView`] 在其上附加形态类型参数，供业务代码以类型安全方式读写。
//!
//! ## 启用语义（How）
//! - `enabled()` 取最近一层显式写入的 `Enabled`；全树都未写入时取形态的 `default_enabled`；
//! - 因此在粗粒度作用域禁用会影响所有未显式重新启用的后代。

use std::{
    borrow::Cow,
    collections::HashSet,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    ops::Deref,
    sync::Arc,
};

use crate::configuration::scope::ConfigurationScope;

/// 启用开关的设置名。
pub const ENABLED: &str = "Enabled";

/// 配置形态标识。
#[derive(Clone)]
pub struct ShapeId {
    namespace: Cow<'static, str>,
    default_enabled: bool,
    mandatory: bool,
    requires: fn() -> Vec<ShapeId>,
}

fn no_requirements() -> Vec<ShapeId> {
    Vec::new()
}

impl ShapeId {
    /// 以命名空间创建形态标识：默认启用、非强制、无依赖。
    pub fn new(namespace: impl Into<Cow<'static, str>>) -> Self {
        Self {
            namespace: namespace.into(),
            default_enabled: true,
            mandatory: false,
            requires: no_requirements,
        }
    }

    /// 设置未显式配置时的启用状态。
    pub fn with_default_enabled(mut self, enabled: bool) -> Self {
        self.default_enabled = enabled;
        self
    }

    /// 标记为强制形态。
    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    /// 声明依赖的其他形态。
    pub fn with_requires(mut self, requires: fn() -> Vec<ShapeId>) -> Self {
        self.requires = requires;
        self
    }

    /// 命名空间。
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// 未显式配置时是否启用。
    pub fn default_enabled(&self) -> bool {
        self.default_enabled
    }

    /// 是否为强制形态。
    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    /// 直接依赖的形态。
    pub fn requires(&self) -> Vec<ShapeId> {
        (self.requires)()
    }

    /// 设置名对应的作用域键。
    pub fn key(&self, setting: &str) -> String {
        format!("{}.{}", self.namespace, setting)
    }

    /// 自身及全部传递依赖，按首次出现顺序去重。
    pub fn flatten(&self) -> Vec<ShapeId> {
        let mut seen = HashSet::new();
        let mut flat = Vec::new();
        let mut pending = vec![self.clone()];
        while let Some(shape) = pending.pop() {
            if !seen.insert(shape.namespace.clone()) {
                continue;
            }
            let mut requires = shape.requires();
            requires.reverse();
            pending.extend(requires);
            flat.push(shape);
        }
        flat
    }
}

impl PartialEq for ShapeId {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace
    }
}

impl Eq for ShapeId {}

impl Hash for ShapeId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
    }
}

impl fmt::Debug for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeId")
            .field("namespace", &self.namespace)
            .field("default_enabled", &self.default_enabled)
            .field("mandatory", &self.mandatory)
            .finish()
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.namespace)
    }
}

/// 类型化配置形态。
///
/// # 教案式说明
/// - **意图 (Why)**：让通知以常量声明自己的命名空间与设置，编译期即可发现拼写错误；
/// - **契约 (What)**：`NAMESPACE` 必须全局唯一；设置以 [`Setting`] 常量声明；
/// - **风险 (Trade-offs)**：覆盖文件只能产出 `bool`/`i64`/`f64`/`String`/`Vec<String>`，
///   希望支持文件配置的设置应选用这些类型。
pub trait ConfigShape: Send + Sync + 'static {
    /// 命名空间。
    const NAMESPACE: &'static str;

    /// 未显式配置时是否启用。
    fn default_enabled() -> bool {
        true
    }

    /// 是否强制要求配置。
    fn mandatory() -> bool {
        false
    }

    /// 依赖的其他形态。
    fn requires() -> Vec<ShapeId> {
        Vec::new()
    }

    /// 形态标识。
    fn id() -> ShapeId {
        ShapeId::new(Self::NAMESPACE)
            .with_default_enabled(Self::default_enabled())
            .with_mandatory(Self::mandatory())
            .with_requires(Self::requires)
    }
}

/// 形态中的一个具名设置。
pub struct Setting<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> Setting<T> {
    /// 声明设置。
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    /// 设置名。
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Setting<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Setting<T> {}

impl<T> fmt::Debug for Setting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// 作用域在某个形态下的无类型视图。
#[derive(Clone, Debug)]
pub struct AdviceConfig {
    scope: Arc<ConfigurationScope>,
    shape: ShapeId,
}

impl AdviceConfig {
    /// 绑定作用域与形态。
    pub fn new(scope: Arc<ConfigurationScope>, shape: ShapeId) -> Self {
        Self { scope, shape }
    }

    /// 绑定的作用域。
    pub fn scope(&self) -> &Arc<ConfigurationScope> {
        &self.scope
    }

    /// 绑定的形态。
    pub fn shape(&self) -> &ShapeId {
        &self.shape
    }

    /// 读取设置，沿祖先查找，缺省为 `T::default()`。
    pub fn get<T>(&self, setting: Setting<T>) -> T
    where
        T: Clone + Default + 'static,
    {
        self.scope.get_value(&self.shape.key(setting.name), true)
    }

    /// 读取设置，缺省时返回 `fallback`。
    pub fn get_or<T>(&self, setting: Setting<T>, fallback: T) -> T
    where
        T: Clone + 'static,
    {
        self.try_get(setting).unwrap_or(fallback)
    }

    /// 读取设置。
    pub fn try_get<T>(&self, setting: Setting<T>) -> Option<T>
    where
        T: Clone + 'static,
    {
        self.scope.try_get_value(&self.shape.key(setting.name), true)
    }

    /// 写入当前作用域。
    pub fn set<T>(&self, setting: Setting<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.scope.set_value(self.shape.key(setting.name), value, false);
    }

    /// 写入当前作用域及全部祖先。
    pub fn set_cascading<T>(&self, setting: Setting<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.scope.set_value(self.shape.key(setting.name), value, true);
    }

    /// 当前作用域下形态是否启用。
    pub fn enabled(&self) -> bool {
        self.scope
            .try_get_value::<bool>(&self.shape.key(ENABLED), true)
            .unwrap_or(self.shape.default_enabled())
    }

    /// 在当前作用域显式启用或禁用。
    pub fn set_enabled(&self, enabled: bool) {
        self.scope.set_value(self.shape.key(ENABLED), enabled, false);
    }

    /// 在当前作用域及全部祖先启用或禁用。
    pub fn set_enabled_cascading(&self, enabled: bool) {
        self.scope.set_value(self.shape.key(ENABLED), enabled, true);
    }

    /// 形态命名空间下是否存在任何键。
    pub fn is_configured(&self) -> bool {
        self.scope.is_shape_configured(&self.shape)
    }
}

/// 作用域在形态 `S` 下的类型化视图。
pub struct ConfigView<S> {
    config: AdviceConfig,
    _shape: PhantomData<fn() -> S>,
}

impl<S: ConfigShape> ConfigView<S> {
    /// 绑定作用域。
    pub fn new(scope: Arc<ConfigurationScope>) -> Self {
        Self {
            config: AdviceConfig::new(scope, S::id()),
            _shape: PhantomData,
        }
    }

    /// 转为无类型视图。
    pub fn untyped(&self) -> &AdviceConfig {
        &self.config
    }
}

impl<S> Deref for ConfigView<S> {
    type Target = AdviceConfig;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

impl<S> Clone for ConfigView<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            _shape: PhantomData,
        }
    }
}
