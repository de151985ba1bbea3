//! # ConfigurationScope：分层配置作用域
//!
//! ## 核心意图（Why）
//! - 以 `Global → Module → Contract → Method` 四级树承载配置值与通知注册，
//!   细粒度作用域可覆盖粗粒度作用域的值；
//! - 通知在任意层级声明，沿树向下被所有匹配切点的方法继承。
//!
//! ## 行为契约（What）
//! - 树由根自上而下以强引用持有，子节点只保留指向父节点的弱引用；
//! - `get_value` 先查本地，再按需逐级向上；未设置或类型不符都回落为 `T::default()`，从不报错；
//! - `lock()` 只冻结结构（子节点与通知注册），值写入始终允许。
//!
//! ## 风险提示（Trade-offs）
//! - 某一层的值类型与请求类型不符时视为该层未设置并继续向上查找，
//!   写入方与读取方约定不一致时不会得到任何告警。

use std::{
    any::Any,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::{
    advice::AdviceRegistration,
    configuration::shape::{AdviceConfig, ConfigShape, ConfigView, ShapeId},
    error::ConfigurationError,
};

/// 作用域中保存的类型擦除值。
pub type ScopeValue = Arc<dyn Any + Send + Sync>;

/// 作用域层级。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKind {
    Global,
    Module,
    Contract,
    Method,
}

impl ScopeKind {
    /// 以稳定字符串表示层级。
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Module => "module",
            Self::Contract => "contract",
            Self::Method => "method",
        }
    }

    /// 下一级层级；`Method` 没有下级。
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Global => Some(Self::Module),
            Self::Module => Some(Self::Contract),
            Self::Contract => Some(Self::Method),
            Self::Method => None,
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 配置树中的一个节点。
///
/// # 教案式说明
/// - **意图 (Why)**：同一节点既是键值存储，也是通知注册的宿主；
/// - **契约 (What)**：
///   - 键区分大小写；
///   - 通知注册按声明顺序保存，构建器自行处理跨层去重；
///   - 节点总以 `Arc` 形式出现，创建子节点需要 `self: &Arc<Self>`；
/// - **设计权衡 (Trade-offs)**：值表使用 `DashMap` 以支持调用期并发读取，
///   子节点与通知列表变更稀少，使用 `RwLock<Vec<_>>` 即可。
pub struct ConfigurationScope {
    kind: ScopeKind,
    name: String,
    parent: Weak<ConfigurationScope>,
    values: DashMap<String, ScopeValue>,
    children: RwLock<Vec<Arc<ConfigurationScope>>>,
    advices: RwLock<Vec<AdviceRegistration>>,
    locked: AtomicBool,
}

impl ConfigurationScope {
    fn new(kind: ScopeKind, name: impl Into<String>, parent: Weak<ConfigurationScope>) -> Self {
        Self {
            kind,
            name: name.into(),
            parent,
            values: DashMap::new(),
            children: RwLock::new(Vec::new()),
            advices: RwLock::new(Vec::new()),
            locked: AtomicBool::new(false),
        }
    }

    /// 创建全局根节点。
    pub fn root() -> Arc<Self> {
        Arc::new(Self::new(ScopeKind::Global, "global", Weak::new()))
    }

    /// 层级。
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// 节点名。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 父节点；根节点或父节点已释放时返回 `None`。
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent.upgrade()
    }

    /// 自父节点起直至根节点的祖先序列。
    pub fn ancestors(&self) -> Vec<Arc<Self>> {
        let mut ancestors = Vec::new();
        let mut current = self.parent();
        while let Some(scope) = current {
            current = scope.parent();
            ancestors.push(scope);
        }
        ancestors
    }

    /// 自根节点起的路径，例如 `global/app/dyn app::Calc/add`。
    pub fn path(&self) -> String {
        let mut names: Vec<String> = self
            .ancestors()
            .iter()
            .map(|scope| scope.name.clone())
            .collect();
        names.reverse();
        names.push(self.name.clone());
        names.join("/")
    }

    /// 沿自身与祖先依次访问，直到闭包返回 `Some`。
    fn find_upward<R>(&self, search_ancestors: bool, mut visit: impl FnMut(&Self) -> Option<R>) -> Option<R> {
        if let Some(found) = visit(self) {
            return Some(found);
        }
        if !search_ancestors {
            return None;
        }
        let mut current = self.parent();
        while let Some(scope) = current {
            if let Some(found) = visit(scope.as_ref()) {
                return Some(found);
            }
            current = scope.parent();
        }
        None
    }

    /// 读取值；未设置或类型不符时返回 `T::default()`。
    pub fn get_value<T>(&self, key: &str, search_ancestors: bool) -> T
    where
        T: Clone + Default + 'static,
    {
        self.try_get_value(key, search_ancestors).unwrap_or_default()
    }

    /// 读取值；未设置或类型不符时返回 `None`。
    pub fn try_get_value<T>(&self, key: &str, search_ancestors: bool) -> Option<T>
    where
        T: Clone + 'static,
    {
        self.find_upward(search_ancestors, |scope| {
            scope
                .values
                .get(key)
                .and_then(|value| value.downcast_ref::<T>().cloned())
        })
    }

    /// 读取最近的擦除值，不做类型检查。
    pub fn raw_value(&self, key: &str, search_ancestors: bool) -> Option<ScopeValue> {
        self.find_upward(search_ancestors, |scope| {
            scope.values.get(key).map(|value| Arc::clone(value.value()))
        })
    }

    /// 键是否存在。
    pub fn contains_key(&self, key: &str, search_ancestors: bool) -> bool {
        self.find_upward(search_ancestors, |scope| {
            scope.values.contains_key(key).then_some(())
        })
        .is_some()
    }

    /// 写入值；`write_to_ancestors` 为真时同一值也写入每个祖先。
    pub fn set_value<T>(&self, key: impl Into<String>, value: T, write_to_ancestors: bool)
    where
        T: Send + Sync + 'static,
    {
        self.set_raw(key.into(), Arc::new(value), write_to_ancestors);
    }

    pub(crate) fn set_raw(&self, key: String, value: ScopeValue, write_to_ancestors: bool) {
        if write_to_ancestors {
            for ancestor in self.ancestors() {
                ancestor.values.insert(key.clone(), Arc::clone(&value));
            }
        }
        self.values.insert(key, value);
    }

    /// 删除本地值，返回是否存在。
    pub fn remove_value(&self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// 本地是否存在属于命名空间 `namespace` 的键。
    ///
    /// 键形如 `"{namespace}.{setting}"`，设置名不含 `.`，因此以最后一个 `.` 之前的部分整体比较；
    /// 命名空间 `a` 不会认领 `a.b.x` 这样的键。
    fn has_namespace(&self, namespace: &str) -> bool {
        self.values.iter().any(|entry| {
            entry
                .key()
                .rsplit_once('.')
                .is_some_and(|(owner, _)| owner == namespace)
        })
    }

    /// 冻结结构。
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    /// 是否已冻结。
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn ensure_unlocked(&self) -> Result<(), ConfigurationError> {
        if self.is_locked() {
            return Err(ConfigurationError::ScopeLocked { scope: self.path() });
        }
        Ok(())
    }

    /// 按名称查找已存在的子节点。
    pub fn find_child(&self, name: &str) -> Option<Arc<Self>> {
        self.children
            .read()
            .iter()
            .find(|child| child.name == name)
            .cloned()
    }

    /// 获取或创建下一级子节点。
    ///
    /// - **契约 (What)**：已存在的子节点总能取回；只有新建时才检查锁定状态；
    ///   `Method` 节点没有下级，调用会返回自身。
    pub fn child(self: &Arc<Self>, name: &str) -> Result<Arc<Self>, ConfigurationError> {
        let Some(kind) = self.kind.child() else {
            return Ok(Arc::clone(self));
        };
        if let Some(existing) = self.find_child(name) {
            return Ok(existing);
        }
        self.ensure_unlocked()?;
        let mut children = self.children.write();
        if let Some(existing) = children.iter().find(|child| child.name == name) {
            return Ok(Arc::clone(existing));
        }
        let child = Arc::new(Self::new(kind, name, Arc::downgrade(self)));
        children.push(Arc::clone(&child));
        Ok(child)
    }

    /// 当前子节点快照。
    pub fn children(&self) -> Vec<Arc<Self>> {
        self.children.read().clone()
    }

    /// 在本节点声明一条通知注册。
    pub fn add_advice(&self, registration: AdviceRegistration) -> Result<(), ConfigurationError> {
        self.ensure_unlocked()?;
        self.advices.write().push(registration);
        Ok(())
    }

    /// 本节点声明的通知注册快照。
    pub fn advices(&self) -> Vec<AdviceRegistration> {
        self.advices.read().clone()
    }

    /// 以形态 `S` 的类型化视图访问本节点。
    pub fn configure_as<S: ConfigShape>(self: &Arc<Self>) -> ConfigView<S> {
        ConfigView::new(Arc::clone(self))
    }

    /// 以任意形态标识访问本节点。
    pub fn advice_config(self: &Arc<Self>, shape: ShapeId) -> AdviceConfig {
        AdviceConfig::new(Arc::clone(self), shape)
    }

    /// 形态 `S` 的命名空间下是否存在任何键（本节点或祖先）。
    pub fn is_configured<S: ConfigShape>(&self) -> bool {
        self.is_shape_configured(&S::id())
    }

    /// 形态的命名空间下是否存在任何键（本节点或祖先）。
    pub fn is_shape_configured(&self, shape: &ShapeId) -> bool {
        let namespace = shape.namespace();
        self.find_upward(true, |scope| scope.has_namespace(namespace).then_some(()))
            .is_some()
    }
}

impl fmt::Debug for ConfigurationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationScope")
            .field("kind", &self.kind)
            .field("path", &self.path())
            .field("values", &self.values.len())
            .field("advices", &self.advices.read().len())
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// 从契约类型名推导模块名：去掉 `dyn ` 前缀后取第一个路径段。
pub fn module_name_of(type_name: &str) -> &str {
    let trimmed = type_name.strip_prefix("dyn ").unwrap_or(type_name);
    match trimmed.split_once("::") {
        Some((module, _)) if !module.is_empty() => module,
        _ => "default",
    }
}

/// 拥有全局根节点的配置树。
#[derive(Clone, Debug)]
pub struct ScopeTree {
    root: Arc<ConfigurationScope>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    /// 创建只含根节点的配置树。
    pub fn new() -> Self {
        Self {
            root: ConfigurationScope::root(),
        }
    }

    /// 全局根节点。
    pub fn global(&self) -> &Arc<ConfigurationScope> {
        &self.root
    }

    /// 获取或创建模块节点。
    pub fn module(&self, name: &str) -> Result<Arc<ConfigurationScope>, ConfigurationError> {
        self.root.child(name)
    }

    /// 获取或创建契约节点。
    pub fn contract(
        &self,
        module: &str,
        contract: &str,
    ) -> Result<Arc<ConfigurationScope>, ConfigurationError> {
        self.module(module)?.child(contract)
    }

    /// 获取或创建方法节点。
    pub fn method(
        &self,
        contract: &Arc<ConfigurationScope>,
        method: &str,
    ) -> Result<Arc<ConfigurationScope>, ConfigurationError> {
        contract.child(method)
    }

    /// 在全部模块中查找已存在的契约节点。
    pub fn find_contract(&self, contract: &str) -> Option<Arc<ConfigurationScope>> {
        self.root
            .children()
            .iter()
            .find_map(|module| module.find_child(contract))
    }

    /// 查找契约节点，不存在时在推导出的模块下创建。
    pub fn contract_by_name(
        &self,
        contract: &str,
    ) -> Result<Arc<ConfigurationScope>, ConfigurationError> {
        match self.find_contract(contract) {
            Some(scope) => Ok(scope),
            None => self.contract(module_name_of(contract), contract),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (ScopeTree, Arc<ConfigurationScope>) {
        let tree = ScopeTree::new();
        let contract = tree.contract("app", "dyn app::Calc").unwrap();
        let method = tree.method(&contract, "add").unwrap();
        (tree, method)
    }

    #[test]
    fn method_ancestors_walk_up_to_global() {
        let (_, method) = sample();
        let kinds: Vec<ScopeKind> = method.ancestors().iter().map(|scope| scope.kind()).collect();
        assert_eq!(
            kinds,
            vec![ScopeKind::Contract, ScopeKind::Module, ScopeKind::Global]
        );
        assert_eq!(method.path(), "global/app/dyn app::Calc/add");
    }

    #[test]
    fn unset_and_mistyped_values_fall_back_to_default() {
        let (tree, method) = sample();
        assert_eq!(method.get_value::<i64>("retries", true), 0);

        tree.global().set_value("retries", String::from("three"), false);
        assert_eq!(method.get_value::<i64>("retries", true), 0);
        assert!(method.contains_key("retries", true));
        assert!(!method.contains_key("retries", false));
    }

    #[test]
    fn local_value_overrides_inherited_value() {
        let (tree, method) = sample();
        tree.global().set_value("timeout", 30_i64, false);
        method.set_value("timeout", 5_i64, false);
        assert_eq!(method.get_value::<i64>("timeout", true), 5);
        assert_eq!(method.parent().unwrap().get_value::<i64>("timeout", true), 30);
        assert_eq!(method.get_value::<i64>("timeout", false), 5);
    }

    #[test]
    fn locked_scope_rejects_structural_changes_only() {
        let (tree, _) = sample();
        let module = tree.module("app").unwrap();
        module.lock();

        assert!(tree.contract("app", "dyn app::Calc").is_ok());
        assert!(matches!(
            tree.contract("app", "dyn app::Other"),
            Err(ConfigurationError::ScopeLocked { .. })
        ));
        module.set_value("still", true, false);
        assert!(module.get_value::<bool>("still", false));
    }

    #[test]
    fn nested_namespaces_do_not_configure_their_parent() {
        let (tree, method) = sample();
        let outer = ShapeId::new("audit");
        let inner = ShapeId::new("audit.trail");
        tree.global().set_value(inner.key("target"), String::from("disk"), false);

        assert!(method.is_shape_configured(&inner));
        assert!(!method.is_shape_configured(&outer));

        method.set_value(outer.key("level"), 2_i64, false);
        assert!(method.is_shape_configured(&outer));
    }

    #[test]
    fn module_names_are_derived_from_type_paths() {
        assert_eq!(module_name_of("dyn app::Calc"), "app");
        assert_eq!(module_name_of("billing::invoice::Service"), "billing");
        assert_eq!(module_name_of("Calc"), "default");
    }

    mod inheritance {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn cascading_write_is_visible_until_overridden(value in any::<i64>(), local in any::<i64>()) {
                let (tree, method) = sample();
                method.set_value("k", value, true);
                prop_assert_eq!(tree.global().get_value::<i64>("k", false), value);
                let sibling = tree.contract("app", "dyn app::Calc").unwrap().child("sub").unwrap();
                prop_assert_eq!(sibling.get_value::<i64>("k", true), value);

                sibling.set_value("k", local, false);
                prop_assert_eq!(sibling.get_value::<i64>("k", true), local);
                prop_assert_eq!(method.get_value::<i64>("k", true), value);
            }
        }
    }
}
