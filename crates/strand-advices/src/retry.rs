use std::{borrow::Cow, sync::Arc};

use async_trait::async_trait;
use strand_core::{
    Advice, AdviceConfig, AdviceType, ConfigShape, ConfigView, Fault, Invocation, Next, Payload,
    PipelineError, Setting, ShapeId,
};
use tracing::{debug, warn};

/// 重试通知的配置形态。
///
/// - `max_attempts`：包含首次调用在内的最大尝试次数，默认 `3`，必须不小于 `1`。
pub struct RetrySettings;

impl RetrySettings {
    pub const MAX_ATTEMPTS: Setting<i64> = Setting::new("max_attempts");
    pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;
}

impl ConfigShape for RetrySettings {
    const NAMESPACE: &'static str = "strand.advices.retry";
}

/// 失败时重放后续步骤。
///
/// # 教案式说明
/// - **意图（Why）**：容器与分发引擎都不做内部重试，需要重试的方法显式挂载本通知；
/// - **契约（What）**：
///   - 后续步骤返回错误时重新执行 `next.proceed`，直至成功或达到 `max_attempts`；
///   - 调用被取消后不再重试；
///   - 最终失败时返回最后一次的错误，不做包装；
/// - **风险提示（Trade-offs）**：重放会再次交出同一组参数，方法调用器应以
///   `MethodArguments::cloned`/`get` 读取参数；用 `take` 取走参数的方法在第二次尝试时
///   会得到参数类型错误。
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryAdvice;

impl RetryAdvice {
    /// 以容器中的单例挂载。
    pub fn advice_type() -> AdviceType {
        AdviceType::of::<Self>()
    }
}

fn max_attempts(config: &AdviceConfig) -> i64 {
    config.get_or(RetrySettings::MAX_ATTEMPTS, RetrySettings::DEFAULT_MAX_ATTEMPTS)
}

#[async_trait]
impl Advice for RetryAdvice {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(RetrySettings::NAMESPACE)
    }

    fn shape(&self) -> ShapeId {
        RetrySettings::id()
    }

    fn configure(&self, config: &AdviceConfig) -> Result<(), PipelineError> {
        let attempts = max_attempts(config);
        if attempts < 1 {
            return Err(PipelineError::InvalidConfiguration {
                method: config.scope().path(),
                advice: RetrySettings::NAMESPACE.to_owned(),
                reason: format!("max_attempts must be at least 1, got {attempts}"),
            });
        }
        Ok(())
    }

    async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
        let settings = ConfigView::<RetrySettings>::new(Arc::clone(invocation.scope()));
        let attempts = max_attempts(&settings).max(1);
        let mut attempt = 1;
        loop {
            let error = match next.proceed(invocation).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if attempt >= attempts {
                warn!(
                    invocation = %invocation.id(),
                    attempts = attempt,
                    error = %error,
                    "retries exhausted"
                );
                return Err(error);
            }
            if invocation.is_cancelled() {
                debug!(invocation = %invocation.id(), attempt, "invocation cancelled, not retrying");
                return Err(error);
            }
            debug!(invocation = %invocation.id(), attempt, error = %error, "retrying invocation");
            attempt += 1;
        }
    }
}
