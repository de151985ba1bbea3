use std::{borrow::Cow, sync::Arc};

use async_trait::async_trait;
use strand_core::{
    Advice, AdviceType, ConfigShape, ConfigView, Fault, Invocation, Next, Payload, Setting,
    ShapeId,
};
use thiserror::Error;
use tracing::debug;

/// 调用方身份，经由 [`Dispatcher::with_caller`](strand_core::Dispatcher::with_caller) 附加到代理。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    name: String,
    roles: Vec<String>,
}

impl Principal {
    pub fn new<I, R>(name: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            name: name.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn has_any_role(&self, allowed: &[String]) -> bool {
        self.roles.iter().any(|role| allowed.contains(role))
    }
}

/// 鉴权通知的配置形态，强制要求配置。
///
/// - `allowed_roles`：允许调用的角色列表；列表为空时拒绝所有调用方。
pub struct AuthorizationSettings;

impl AuthorizationSettings {
    pub const ALLOWED_ROLES: Setting<Vec<String>> = Setting::new("allowed_roles");
}

impl ConfigShape for AuthorizationSettings {
    const NAMESPACE: &'static str = "strand.advices.authorization";

    fn mandatory() -> bool {
        true
    }
}

/// 鉴权失败。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    /// 代理未附带 [`Principal`]。
    #[error("anonymous caller may not invoke `{method}`")]
    Anonymous { method: String },

    /// 调用方不具备任何允许的角色。
    #[error("principal `{principal}` lacks any of [{}] required by `{method}`", .allowed.join(", "))]
    Denied {
        principal: String,
        method: String,
        allowed: Vec<String>,
    },
}

/// 以调用方角色校验方法访问。
///
/// # 教案式说明
/// - **意图（Why）**：访问控制随作用域配置，同一实现可以在不同模块下授予不同角色；
/// - **契约（What）**：调用方必须是 [`Principal`] 且至少具备一个 `allowed_roles` 中的角色，
///   否则返回 [`AuthorizationError`] 且不执行后续步骤；
/// - **风险提示（Trade-offs）**：应排在重试之前，拒绝不应被重试。
#[derive(Clone, Copy, Debug, Default)]
pub struct AuthorizationAdvice;

impl AuthorizationAdvice {
    /// 以容器中的单例挂载。
    pub fn advice_type() -> AdviceType {
        AdviceType::of::<Self>()
    }
}

#[async_trait]
impl Advice for AuthorizationAdvice {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(AuthorizationSettings::NAMESPACE)
    }

    fn shape(&self) -> ShapeId {
        AuthorizationSettings::id()
    }

    async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
        let settings = ConfigView::<AuthorizationSettings>::new(Arc::clone(invocation.scope()));
        let allowed = settings.get(AuthorizationSettings::ALLOWED_ROLES);
        let method = invocation.method().qualified_name();

        let Some(principal) = invocation.caller_as::<Principal>() else {
            return Err(Box::new(AuthorizationError::Anonymous { method }));
        };
        if !principal.has_any_role(&allowed) {
            debug!(principal = %principal.name(), method = %method, "access denied");
            return Err(Box::new(AuthorizationError::Denied {
                principal: principal.name().to_owned(),
                method,
                allowed,
            }));
        }
        next.proceed(invocation).await
    }
}
