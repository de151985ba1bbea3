use std::{fmt, sync::Arc};

use crate::{
    advice::Advice,
    configuration::{scope::ConfigurationScope, shape::ShapeId},
    dispatch::{arguments::MethodInvoker, result::ResultConverter},
    method::{MethodDescriptor, MethodKey},
};

/// 单个方法的已构建管线。
///
/// # 教案式说明
/// - **意图 (Why)**：把一次构建的全部产物（有序通知链、结果转换器、配置形态集合）打包为不可变对象，
///   调用期只需克隆一个 `Arc`；
/// - **契约 (What)**：`generation` 记录构建时注册表的代次，代次变化后下一次解析会重建，
///   已开始的调用继续使用旧对象；
/// - **设计权衡 (Trade-offs)**：通知名称在构建时即生成，诊断路径不必再调用 `Advice::name`。
pub struct MethodInvocationConfiguration {
    pub(crate) key: MethodKey,
    pub(crate) descriptor: Arc<MethodDescriptor>,
    pub(crate) scope: Arc<ConfigurationScope>,
    pub(crate) chain: Arc<[Arc<dyn Advice>]>,
    pub(crate) names: Vec<String>,
    pub(crate) converter: ResultConverter,
    pub(crate) shapes: Vec<ShapeId>,
    pub(crate) invoker: Option<MethodInvoker>,
    pub(crate) generation: u64,
}

impl MethodInvocationConfiguration {
    /// 方法键。
    pub fn key(&self) -> MethodKey {
        self.key
    }

    /// 方法描述符。
    pub fn descriptor(&self) -> &Arc<MethodDescriptor> {
        &self.descriptor
    }

    /// 方法作用域。
    pub fn scope(&self) -> &Arc<ConfigurationScope> {
        &self.scope
    }

    /// 生效的通知链。
    pub fn chain(&self) -> &Arc<[Arc<dyn Advice>]> {
        &self.chain
    }

    /// 通知链中各步骤的名称。
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// 结果转换器。
    pub fn converter(&self) -> &ResultConverter {
        &self.converter
    }

    /// 链中全部通知的配置形态（含传递依赖，已去重）。
    pub fn shapes(&self) -> &[ShapeId] {
        &self.shapes
    }

    pub(crate) fn invoker(&self) -> Option<&MethodInvoker> {
        self.invoker.as_ref()
    }

    /// 构建时的注册表代次。
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for MethodInvocationConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInvocationConfiguration")
            .field("key", &self.key)
            .field("method", &self.descriptor.qualified_name())
            .field("chain", &self.names)
            .field("declared", self.converter.declared())
            .field("generation", &self.generation)
            .finish()
    }
}
