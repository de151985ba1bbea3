use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use strand_advices::{
    AuthorizationAdvice, AuthorizationError, LoggingAdvice, LoggingSettings, Principal,
    RetryAdvice, RetrySettings,
};
use strand_core::{
    AdviceId, AdviceOrdering, Cancellation, DispatchError, Fault, InterceptionRegistry,
    MethodDescriptor, MethodKey, PipelineError, Pointcut, ReturnValue, arguments,
};
use strand_ioc::Lifetime;
use tracing_test::traced_test;

#[derive(Debug, thiserror::Error)]
#[error("{0} is out of stock")]
struct OutOfStock(String);

trait Inventory: Send + Sync {
    fn reserve(&self, sku: String) -> Result<u32, Fault>;
}

struct Warehouse {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl Inventory for Warehouse {
    fn reserve(&self, sku: String) -> Result<u32, Fault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(Box::new(OutOfStock(sku)));
        }
        Ok(sku.len() as u32)
    }
}

struct Fixture {
    registry: InterceptionRegistry,
    reserve: MethodKey,
    warehouse: Arc<Warehouse>,
}

impl Fixture {
    fn new(failures: usize) -> Self {
        let registry = InterceptionRegistry::new();
        strand_advices::install(registry.container()).unwrap();

        let inventory = registry.configure_contract::<dyn Inventory>().unwrap();
        let reserve = inventory
            .method(
                MethodDescriptor::new::<dyn Inventory>("reserve")
                    .param::<String>("sku")
                    .param::<Cancellation>("token")
                    .returns::<u32>(),
                |target, arguments| {
                    let sku = arguments.cloned::<String>(0)?;
                    target.reserve(sku).map(ReturnValue::ready)
                },
            )
            .unwrap();
        let warehouse = Arc::new(Warehouse {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        });
        let shared = Arc::clone(&warehouse);
        inventory
            .implementation_factory(Lifetime::Singleton, move |_| {
                Ok(Arc::clone(&shared) as Arc<dyn Inventory>)
            })
            .unwrap();

        Self {
            registry,
            reserve,
            warehouse,
        }
    }

    fn contract(&self) -> Arc<strand_core::ConfigurationScope> {
        self.registry.contract_scope::<dyn Inventory>().unwrap()
    }

    fn attach(&self, advice: strand_core::AdviceType, ordering: AdviceOrdering) {
        self.registry
            .add_advice(&self.contract(), advice, Pointcut::all(), ordering)
            .unwrap();
    }

    fn reserve(&self, caller: Option<Principal>, token: Cancellation) -> Result<u32, Fault> {
        let target = Arc::clone(&self.warehouse) as Arc<dyn Inventory>;
        let mut dispatcher = self.registry.dispatcher_for::<dyn Inventory>(Some(target));
        if let Some(caller) = caller {
            dispatcher = dispatcher.with_caller(caller);
        }
        dispatcher.invoke_blocking(self.reserve, arguments![String::from("sku-42"), token])
    }

    fn calls(&self) -> usize {
        self.warehouse.calls.load(Ordering::SeqCst)
    }
}

#[test]
fn install_registers_singletons() {
    let registry = InterceptionRegistry::new();
    strand_advices::install(registry.container()).unwrap();
    let container = registry.container();
    assert!(container.contains::<LoggingAdvice>());
    assert!(container.contains::<RetryAdvice>());
    assert!(container.contains::<AuthorizationAdvice>());
    let first = container.get_required::<RetryAdvice>().unwrap();
    let second = container.get_required::<RetryAdvice>().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
#[traced_test]
fn logging_reports_success_and_failure() {
    let fixture = Fixture::new(1);
    fixture.attach(LoggingAdvice::advice_type(), AdviceOrdering::new());

    let fault = fixture.reserve(None, Cancellation::new()).unwrap_err();
    assert!(fault.downcast_ref::<OutOfStock>().is_some());
    assert!(logs_contain("invocation failed"));

    assert_eq!(fixture.reserve(None, Cancellation::new()).unwrap(), 6);
    assert!(logs_contain("invocation completed"));
    assert!(logs_contain("elapsed_ms"));
}

#[test]
#[traced_test]
fn logging_records_arguments_when_configured() {
    let fixture = Fixture::new(0);
    fixture.attach(LoggingAdvice::advice_type(), AdviceOrdering::new());
    let logging = fixture.contract().configure_as::<LoggingSettings>();
    logging.set(LoggingSettings::LOG_ARGUMENTS, true);

    fixture.reserve(None, Cancellation::new()).unwrap();
    assert!(logs_contain("invocation started"));
    assert!(!logs_contain("slow invocation"));
}

#[test]
fn negative_slow_threshold_is_rejected_at_build_time() {
    let fixture = Fixture::new(0);
    fixture.attach(LoggingAdvice::advice_type(), AdviceOrdering::new());
    fixture
        .contract()
        .configure_as::<LoggingSettings>()
        .set(LoggingSettings::SLOW_CALL_MS, -5_i64);
    fixture.registry.invalidate();
    assert!(matches!(
        fixture.registry.invocation_configuration(fixture.reserve),
        Err(PipelineError::InvalidConfiguration { .. })
    ));
}

#[test]
fn retry_recovers_from_transient_failures() {
    let fixture = Fixture::new(2);
    fixture.attach(RetryAdvice::advice_type(), AdviceOrdering::new());
    assert_eq!(fixture.reserve(None, Cancellation::new()).unwrap(), 6);
    assert_eq!(fixture.calls(), 3);
}

#[test]
fn retry_returns_the_last_error_unchanged() {
    let fixture = Fixture::new(10);
    fixture.attach(RetryAdvice::advice_type(), AdviceOrdering::new());
    let method_scope = fixture.registry.method_scope(fixture.reserve).unwrap();
    method_scope
        .configure_as::<RetrySettings>()
        .set(RetrySettings::MAX_ATTEMPTS, 4_i64);

    let fault = fixture.reserve(None, Cancellation::new()).unwrap_err();
    assert_eq!(fault.to_string(), "sku-42 is out of stock");
    assert!(fault.downcast_ref::<OutOfStock>().is_some());
    assert_eq!(fixture.calls(), 4);
}

#[test]
fn retry_stops_once_cancelled() {
    let fixture = Fixture::new(10);
    fixture.attach(RetryAdvice::advice_type(), AdviceOrdering::new());
    let token = Cancellation::new();
    token.cancel();
    assert!(fixture.reserve(None, token).is_err());
    assert_eq!(fixture.calls(), 1);
}

#[test]
fn retry_can_be_disabled_by_overlay() {
    let fixture = Fixture::new(1);
    fixture.attach(RetryAdvice::advice_type(), AdviceOrdering::new());
    fixture
        .registry
        .apply_toml(&format!(
            "[contract.\"{}\"]\n\"strand.advices.retry.Enabled\" = false\n",
            std::any::type_name::<dyn Inventory>()
        ))
        .unwrap();
    assert!(fixture.reserve(None, Cancellation::new()).is_err());
    assert_eq!(fixture.calls(), 1);
}

#[test]
fn authorization_requires_configuration() {
    let fixture = Fixture::new(0);
    fixture.attach(AuthorizationAdvice::advice_type(), AdviceOrdering::new());
    match fixture.registry.invocation_configuration(fixture.reserve) {
        Err(PipelineError::MissingConfiguration { shape, .. }) => {
            assert_eq!(shape, "strand.advices.authorization")
        }
        other => panic!("unexpected build result: {other:?}"),
    }
    let fault = fixture.reserve(None, Cancellation::new()).unwrap_err();
    assert!(matches!(
        fault.downcast_ref::<DispatchError>(),
        Some(DispatchError::Pipeline(PipelineError::MissingConfiguration { .. }))
    ));
}

#[test]
fn authorization_checks_caller_roles_before_retrying() {
    let fixture = Fixture::new(0);
    fixture.attach(RetryAdvice::advice_type(), AdviceOrdering::new());
    fixture.attach(
        AuthorizationAdvice::advice_type(),
        AdviceOrdering::new().before(AdviceId::of::<RetryAdvice>()),
    );
    fixture
        .registry
        .apply_toml(&format!(
            "[contract.\"{}\"]\n\"strand.advices.authorization.allowed_roles\" = [\"clerk\", \"admin\"]\n",
            std::any::type_name::<dyn Inventory>()
        ))
        .unwrap();

    let names = fixture
        .registry
        .invocation_configuration(fixture.reserve)
        .unwrap()
        .names()
        .to_vec();
    assert_eq!(
        names,
        [
            "strand.advices.authorization",
            "strand.advices.retry",
            "strand.implementation-dispatch"
        ]
    );

    let clerk = Principal::new("ann", ["clerk"]);
    assert_eq!(fixture.reserve(Some(clerk), Cancellation::new()).unwrap(), 6);

    let guest = Principal::new("bob", ["guest"]);
    let fault = fixture.reserve(Some(guest), Cancellation::new()).unwrap_err();
    assert_eq!(
        fault.downcast_ref::<AuthorizationError>(),
        Some(&AuthorizationError::Denied {
            principal: String::from("bob"),
            method: format!("{}::reserve", std::any::type_name::<dyn Inventory>()),
            allowed: vec![String::from("clerk"), String::from("admin")],
        })
    );

    let fault = fixture.reserve(None, Cancellation::new()).unwrap_err();
    assert!(matches!(
        fault.downcast_ref::<AuthorizationError>(),
        Some(AuthorizationError::Anonymous { .. })
    ));
    assert_eq!(fixture.calls(), 1);
}

#[tokio::test]
async fn advices_drive_async_contracts() {
    trait Clock: Send + Sync {
        fn tick(&self) -> strand_core::AsyncResult<u64>;
    }

    struct Ticker(AtomicUsize);

    impl Clock for Ticker {
        fn tick(&self) -> strand_core::AsyncResult<u64> {
            let failed_before = self.0.fetch_add(1, Ordering::SeqCst) > 0;
            Box::pin(async move {
                tokio::task::yield_now().await;
                if failed_before {
                    Ok(7)
                } else {
                    Err(Box::new(OutOfStock(String::from("tick"))) as Fault)
                }
            })
        }
    }

    let registry = InterceptionRegistry::new();
    strand_advices::install(registry.container()).unwrap();
    let clock = registry.configure_contract::<dyn Clock>().unwrap();
    let tick = clock
        .method(
            MethodDescriptor::new::<dyn Clock>("tick").returns_future::<u64>(),
            |target, _| Ok(ReturnValue::future(target.tick())),
        )
        .unwrap();
    let ticker: Arc<dyn Clock> = Arc::new(Ticker(AtomicUsize::new(0)));
    let shared = Arc::clone(&ticker);
    clock
        .implementation_factory(Lifetime::Singleton, move |_| Ok(Arc::clone(&shared)))
        .unwrap();
    clock
        .add_advice(RetryAdvice::advice_type(), Pointcut::all(), AdviceOrdering::new())
        .unwrap();

    let dispatcher = registry.dispatcher_for::<dyn Clock>(Some(ticker));
    assert_eq!(dispatcher.invoke_async::<u64>(tick, arguments![]).await.unwrap(), 7);
}
