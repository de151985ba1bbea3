use std::{borrow::Cow, sync::Arc, time::Instant};

use async_trait::async_trait;
use strand_core::{
    Advice, AdviceConfig, AdviceType, ConfigShape, ConfigView, Fault, Invocation, Next, Payload,
    PipelineError, Setting, ShapeId,
};
use tracing::{info, warn};

/// 日志通知的配置形态。
///
/// # 教案式说明
/// - **意图（Why）**：把“是否记录、多慢算慢”外部化到作用域，通知本身保持无状态；
/// - **契约（What）**：
///   - `slow_call_ms`：耗时达到该毫秒数时额外输出 `warn!`；`0` 表示不检测，默认 `0`；
///   - `log_arguments`：是否记录参数个数，默认关闭；
/// - **风险提示（Trade-offs）**：通知在每次调用时读取作用域，配置变更无需重建管线即可生效。
pub struct LoggingSettings;

impl LoggingSettings {
    pub const SLOW_CALL_MS: Setting<i64> = Setting::new("slow_call_ms");
    pub const LOG_ARGUMENTS: Setting<bool> = Setting::new("log_arguments");
}

impl ConfigShape for LoggingSettings {
    const NAMESPACE: &'static str = "strand.advices.logging";
}

/// 记录每次调用的结果与耗时。
///
/// # 教案式说明
/// - **意图（Why）**：统一在通知链中输出调用日志，避免实现中散落重复的日志代码；
/// - **契约（What）**：成功时输出 `info!`，失败时输出 `warn!` 并原样返回错误；
///   字段 `invocation`、`method`、`elapsed_ms` 名称稳定，便于在日志平台上检索；
/// - **风险提示（Trade-offs）**：不做采样，高频方法可在方法作用域上禁用本通知。
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingAdvice;

impl LoggingAdvice {
    /// 以容器中的单例挂载。
    pub fn advice_type() -> AdviceType {
        AdviceType::of::<Self>()
    }
}

#[async_trait]
impl Advice for LoggingAdvice {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(LoggingSettings::NAMESPACE)
    }

    fn shape(&self) -> ShapeId {
        LoggingSettings::id()
    }

    fn configure(&self, config: &AdviceConfig) -> Result<(), PipelineError> {
        let threshold = config.get_or(LoggingSettings::SLOW_CALL_MS, 0);
        if threshold < 0 {
            return Err(PipelineError::InvalidConfiguration {
                method: config.scope().path(),
                advice: LoggingSettings::NAMESPACE.to_owned(),
                reason: format!("slow_call_ms must not be negative, got {threshold}"),
            });
        }
        Ok(())
    }

    async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
        let settings = ConfigView::<LoggingSettings>::new(Arc::clone(invocation.scope()));
        let id = invocation.id();
        let method = invocation.method().qualified_name();
        if settings.get_or(LoggingSettings::LOG_ARGUMENTS, false) {
            info!(
                invocation = %id,
                method = %method,
                arguments = invocation.arguments().len(),
                "invocation started"
            );
        }

        let started = Instant::now();
        let result = next.proceed(invocation).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => info!(invocation = %id, method = %method, elapsed_ms, "invocation completed"),
            Err(error) => warn!(
                invocation = %id,
                method = %method,
                elapsed_ms,
                error = %error,
                "invocation failed"
            ),
        }
        let threshold = settings.get_or(LoggingSettings::SLOW_CALL_MS, 0);
        if threshold > 0 && elapsed_ms >= threshold as u64 {
            warn!(
                invocation = %id,
                method = %method,
                elapsed_ms,
                threshold_ms = threshold,
                "slow invocation"
            );
        }
        result
    }
}
