//! # builder 模块说明
//!
//! ## 角色定位（Why）
//! - 把“散落在四级作用域中的通知注册”变成“某个方法的一条有序、不可变的通知链”；
//! - 构建在首次调用或注册表代次变化后发生，调用路径上只读取构建结果。
//!
//! ## 构建步骤（How）
//! 1. 自方法作用域向上收集切点匹配的注册，同一通知以最近的声明为准；
//! 2. 按排序约束做拓扑排序，实现分发固定在末尾；
//! 3. 从代理所在的容器作用域解析通知实例，开放泛型按 `(契约, 声明返回类型, 管线结果类型)` 实化；
//! 4. 以方法作用域调用 `configure`，丢弃 `Enabled == false` 的通知，校验强制形态；
//! 5. 打包为 [`MethodInvocationConfiguration`]。
//!
//! ## 失败语义（What）
//! - 任一步失败都返回 [`PipelineError`]，不产出部分管线。

use std::{collections::HashSet, iter, sync::Arc};

use strand_ioc::{Container, ServiceKey, downcast};
use tracing::debug;

use crate::{
    advice::{Advice, AdviceRegistration, AdviceSource},
    configuration::{scope::ConfigurationScope, shape::AdviceConfig},
    dispatch::{arguments::MethodInvoker, result::ResultConverter},
    error::PipelineError,
    method::{MethodDescriptor, MethodKey},
    pipeline::{configuration::MethodInvocationConfiguration, ordering},
};

/// 构建一个方法管线所需的输入。
pub(crate) struct BuildInput<'a> {
    pub(crate) key: MethodKey,
    pub(crate) descriptor: &'a Arc<MethodDescriptor>,
    pub(crate) scope: &'a Arc<ConfigurationScope>,
    pub(crate) invoker: Option<MethodInvoker>,
    pub(crate) container: &'a Container,
    pub(crate) generation: u64,
}

/// 收集方法作用域及其祖先上切点匹配的注册，最近的声明优先。
pub(crate) fn collect(
    scope: &Arc<ConfigurationScope>,
    descriptor: &MethodDescriptor,
) -> Vec<AdviceRegistration> {
    let mut seen = HashSet::new();
    let mut collected = Vec::new();
    for level in iter::once(Arc::clone(scope)).chain(scope.ancestors()) {
        for registration in level.advices() {
            if registration.pointcut().matches(descriptor) && seen.insert(registration.id().clone()) {
                collected.push(registration);
            }
        }
    }
    collected
}

pub(crate) fn build(input: BuildInput<'_>) -> Result<MethodInvocationConfiguration, PipelineError> {
    let BuildInput {
        key,
        descriptor,
        scope,
        invoker,
        container,
        generation,
    } = input;
    let method = descriptor.qualified_name();

    let collected = collect(scope, descriptor);
    let composition: Vec<String> = collected
        .iter()
        .map(|registration| registration.id().to_string())
        .collect();
    let ordered = ordering::order(&method, collected)?;

    let mut chain: Vec<Arc<dyn Advice>> = Vec::with_capacity(ordered.len());
    let mut names = Vec::with_capacity(ordered.len());
    let mut shapes = Vec::new();
    for registration in &ordered {
        let advice = resolve(container, registration, descriptor, &method, &composition)?;
        let shape = advice.shape();
        let config = AdviceConfig::new(Arc::clone(scope), shape.clone());
        advice.configure(&config)?;
        if !config.enabled() {
            debug!(
                method = %method,
                advice = %registration.id(),
                "advice disabled for method"
            );
            continue;
        }
        for required in shape.flatten() {
            if required.is_mandatory() && !scope.is_shape_configured(&required) {
                return Err(PipelineError::MissingConfiguration {
                    method,
                    advice: registration.id().to_string(),
                    shape: required.namespace().to_owned(),
                });
            }
            if !shapes.contains(&required) {
                shapes.push(required);
            }
        }
        names.push(advice.name().into_owned());
        chain.push(advice);
    }

    debug!(
        method = %method,
        key = %key,
        scope = %scope.path(),
        container = %container.id(),
        chain = ?names,
        generation,
        "advice pipeline built"
    );

    Ok(MethodInvocationConfiguration {
        key,
        descriptor: Arc::clone(descriptor),
        scope: Arc::clone(scope),
        chain: chain.into(),
        names,
        converter: ResultConverter::new(method, descriptor.return_shape().clone()),
        shapes,
        invoker,
        generation,
    })
}

fn resolve(
    container: &Container,
    registration: &AdviceRegistration,
    descriptor: &MethodDescriptor,
    method: &str,
    composition: &[String],
) -> Result<Arc<dyn Advice>, PipelineError> {
    let unresolvable = |source| PipelineError::UnresolvableAdvice {
        method: method.to_owned(),
        advice: registration.id().to_string(),
        chain: composition.to_vec(),
        source,
    };
    match registration.advice().source() {
        AdviceSource::Instance(advice) => Ok(Arc::clone(advice)),
        AdviceSource::Closed { key, cast } => {
            let instance = container
                .resolve_key(key)
                .map_err(|error| unresolvable(Some(error)))?;
            instance
                .as_ref()
                .and_then(|instance| cast(instance))
                .ok_or_else(|| unresolvable(None))
        }
        AdviceSource::Open { family } => {
            let declared = descriptor.return_shape();
            let key = ServiceKey::generic(
                family.clone(),
                vec![
                    descriptor.contract(),
                    declared.type_key(),
                    declared.payload_key(),
                ],
            );
            let instance = container
                .resolve_key(&key)
                .map_err(|error| unresolvable(Some(error)))?;
            instance
                .as_ref()
                .and_then(downcast::<dyn Advice>)
                .ok_or_else(|| unresolvable(None))
        }
    }
}
