//! 端到端调用分发测试：代理 → 通知链 → 实现。

use std::{
    borrow::Cow,
    sync::{
        Arc, Once,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use strand_core::{
    Advice, AdviceId, AdviceOrdering, AdviceType, AsyncResult, Cancellation, DispatchError, Fault,
    InterceptionRegistry, Invocation, MethodDescriptor, MethodKey, Next, Payload, PipelineError,
    Pointcut, ReturnValue, ShapeId, ValueScope, arguments, current_invocation,
    dispatch::{Dispatcher, payload},
};
use strand_ioc::Lifetime;
use tracing_test::traced_test;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, thiserror::Error)]
#[error("division by zero")]
struct DivisionByZero;

trait Calc: Send + Sync {
    fn add(&self, a: i32, b: i32) -> i32;
    fn greet(&self, name: String) -> String;
    fn reset(&self);
    fn divide(&self, a: i32, b: i32) -> Result<i32, Fault>;
    fn observe(&self, token: Cancellation) -> bool;
    fn add_later(&self, a: i32, b: i32) -> AsyncResult<i32>;
}

#[derive(Default)]
struct Calculator {
    resets: AtomicUsize,
}

impl Calc for Calculator {
    fn add(&self, a: i32, b: i32) -> i32 {
        a + b
    }

    fn greet(&self, name: String) -> String {
        let method = current_invocation().map(|current| current.method().name());
        format!("hello {name} from {}", method.unwrap_or("nowhere"))
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn divide(&self, a: i32, b: i32) -> Result<i32, Fault> {
        if b == 0 {
            return Err(Box::new(DivisionByZero));
        }
        Ok(a / b)
    }

    fn observe(&self, token: Cancellation) -> bool {
        token.is_cancelled()
    }

    fn add_later(&self, a: i32, b: i32) -> AsyncResult<i32> {
        async move {
            let before = current_invocation().expect("invocation published before await");
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
            let after = current_invocation().expect("invocation published after await");
            assert!(before.same_as(&after));
            Ok(a + b)
        }
        .boxed()
    }
}

#[derive(Clone, Copy)]
struct CalcMethods {
    add: MethodKey,
    greet: MethodKey,
    reset: MethodKey,
    divide: MethodKey,
    observe: MethodKey,
    add_later: MethodKey,
}

struct CalcProxy {
    dispatcher: Dispatcher,
    methods: CalcMethods,
}

impl Calc for CalcProxy {
    fn add(&self, a: i32, b: i32) -> i32 {
        self.dispatcher
            .invoke_blocking(self.methods.add, arguments![a, b])
            .expect("add")
    }

    fn greet(&self, name: String) -> String {
        self.dispatcher
            .invoke_blocking(self.methods.greet, arguments![name])
            .expect("greet")
    }

    fn reset(&self) {
        self.dispatcher
            .invoke_blocking::<()>(self.methods.reset, arguments![])
            .expect("reset")
    }

    fn divide(&self, a: i32, b: i32) -> Result<i32, Fault> {
        self.dispatcher
            .invoke_blocking(self.methods.divide, arguments![a, b])
    }

    fn observe(&self, token: Cancellation) -> bool {
        self.dispatcher
            .invoke_blocking(self.methods.observe, arguments![token])
            .expect("observe")
    }

    fn add_later(&self, a: i32, b: i32) -> AsyncResult<i32> {
        self.dispatcher
            .invoke_async(self.methods.add_later, arguments![a, b])
    }
}

fn calc_registry() -> (InterceptionRegistry, CalcMethods) {
    init_tracing();
    let registry = InterceptionRegistry::new();
    let calc = registry.configure_contract::<dyn Calc>().unwrap();

    let add = calc
        .method(
            MethodDescriptor::new::<dyn Calc>("add")
                .param::<i32>("a")
                .param::<i32>("b")
                .returns::<i32>(),
            |target, arguments| {
                let a = arguments.cloned::<i32>(0)?;
                let b = arguments.cloned::<i32>(1)?;
                Ok(ReturnValue::ready(target.add(a, b)))
            },
        )
        .unwrap();
    let greet = calc
        .method(
            MethodDescriptor::new::<dyn Calc>("greet")
                .param::<String>("name")
                .returns::<String>(),
            |target, arguments| {
                let name = arguments.take::<String>(0)?;
                Ok(ReturnValue::ready(target.greet(name)))
            },
        )
        .unwrap();
    let reset = calc
        .method(MethodDescriptor::new::<dyn Calc>("reset"), |target, _| {
            target.reset();
            Ok(ReturnValue::void())
        })
        .unwrap();
    let divide = calc
        .method(
            MethodDescriptor::new::<dyn Calc>("divide")
                .param::<i32>("a")
                .param::<i32>("b")
                .returns::<i32>(),
            |target, arguments| {
                let a = arguments.cloned::<i32>(0)?;
                let b = arguments.cloned::<i32>(1)?;
                target.divide(a, b).map(ReturnValue::ready)
            },
        )
        .unwrap();
    let observe = calc
        .method(
            MethodDescriptor::new::<dyn Calc>("observe")
                .param::<Cancellation>("token")
                .returns::<bool>(),
            |target, arguments| {
                let token = arguments.cloned::<Cancellation>(0)?;
                Ok(ReturnValue::ready(target.observe(token)))
            },
        )
        .unwrap();
    let add_later = calc
        .method(
            MethodDescriptor::new::<dyn Calc>("add_later")
                .param::<i32>("a")
                .param::<i32>("b")
                .returns_future::<i32>(),
            |target, arguments| {
                let a = arguments.cloned::<i32>(0)?;
                let b = arguments.cloned::<i32>(1)?;
                Ok(ReturnValue::future(target.add_later(a, b)))
            },
        )
        .unwrap();

    calc.implementation_factory(Lifetime::Singleton, |_| {
        Ok(Arc::new(Calculator::default()) as Arc<dyn Calc>)
    })
    .unwrap();

    let methods = CalcMethods {
        add,
        greet,
        reset,
        divide,
        observe,
        add_later,
    };
    registry
        .register_proxy::<dyn Calc, _>(Lifetime::Transient, move |dispatcher| {
            Arc::new(CalcProxy {
                dispatcher,
                methods,
            }) as Arc<dyn Calc>
        })
        .unwrap();
    (registry, methods)
}

fn proxy(registry: &InterceptionRegistry) -> Arc<dyn Calc> {
    registry.container().get_required::<dyn Calc>().unwrap()
}

type Log = Arc<Mutex<Vec<String>>>;

/// 在 `proceed` 前后记录标签。
struct Trace {
    label: &'static str,
    log: Log,
}

impl Trace {
    fn advice(label: &'static str, log: &Log) -> AdviceType {
        AdviceType::instance(
            AdviceId::named(label),
            Arc::new(Self {
                label,
                log: Arc::clone(log),
            }),
        )
    }
}

#[async_trait]
impl Advice for Trace {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(self.label)
    }

    async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
        self.log.lock().push(format!("{}:before", self.label));
        let result = next.proceed(invocation).await;
        let outcome = if result.is_ok() { "after" } else { "failed" };
        self.log.lock().push(format!("{}:{outcome}", self.label));
        result
    }
}

struct DoubleFirst;

#[async_trait]
impl Advice for DoubleFirst {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("double-first")
    }

    async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
        invocation.replace_argument::<i32, _>(|name, value| if name == "a" { value * 2 } else { value })?;
        next.proceed(invocation).await
    }
}

fn double_first() -> AdviceType {
    AdviceType::instance(AdviceId::named("double-first"), Arc::new(DoubleFirst))
}

#[test]
fn sync_call_returns_implementation_result() {
    let (registry, _) = calc_registry();
    let calc = proxy(&registry);
    assert_eq!(calc.add(2, 3), 5);
    assert_eq!(calc.greet(String::from("ada")), "hello ada from greet");
}

#[test]
fn ordering_constraints_shape_the_wrapping_order() {
    let (registry, methods) = calc_registry();
    let log: Log = Arc::default();
    let contract = registry.contract_scope::<dyn Calc>().unwrap();
    registry
        .add_advice(&contract, Trace::advice("inner", &log), Pointcut::all(), AdviceOrdering::new())
        .unwrap();
    registry
        .add_advice(
            &contract,
            Trace::advice("outer", &log),
            Pointcut::all(),
            AdviceOrdering::new().before("inner"),
        )
        .unwrap();

    assert_eq!(proxy(&registry).add(1, 1), 2);
    assert_eq!(
        *log.lock(),
        vec!["outer:before", "inner:before", "inner:after", "outer:after"]
    );
    let configuration = registry.invocation_configuration(methods.add).unwrap();
    assert_eq!(
        configuration.names(),
        ["outer", "inner", "strand.implementation-dispatch"]
    );
}

#[test]
fn concurrent_calls_share_one_pipeline() {
    let (registry, methods) = calc_registry();
    let calc = proxy(&registry);
    let first = registry.invocation_configuration(methods.add).unwrap();
    std::thread::scope(|scope| {
        for i in 0..100 {
            let calc = Arc::clone(&calc);
            scope.spawn(move || assert_eq!(calc.add(i, i), 2 * i));
        }
    });
    let after = registry.invocation_configuration(methods.add).unwrap();
    assert!(Arc::ptr_eq(&first, &after));
}

#[test]
fn advice_can_rewrite_arguments_by_name() {
    let (registry, methods) = calc_registry();
    let scope = registry.method_scope(methods.add).unwrap();
    registry
        .add_advice(&scope, double_first(), Pointcut::all(), AdviceOrdering::new())
        .unwrap();
    let calc = proxy(&registry);
    assert_eq!(calc.add(2, 3), 7);
    assert_eq!(calc.greet(String::from("x")), "hello x from greet");
}

#[test]
fn adding_advice_rebuilds_the_pipeline() {
    let (registry, methods) = calc_registry();
    let calc = proxy(&registry);
    assert_eq!(calc.add(1, 1), 2);
    let before = registry.invocation_configuration(methods.add).unwrap();

    registry
        .add_advice(registry.global(), double_first(), Pointcut::method_named("add"), AdviceOrdering::new())
        .unwrap();
    assert_eq!(calc.add(1, 1), 3);
    let after = registry.invocation_configuration(methods.add).unwrap();
    assert!(after.generation() > before.generation());
    assert_eq!(before.names().len() + 1, after.names().len());
}

#[test]
fn declared_method_without_implementation_exhausts_the_chain() {
    trait Silent: Send + Sync {}

    let registry = InterceptionRegistry::new();
    let silent = registry.configure_contract::<dyn Silent>().unwrap();
    let ping = silent
        .declare(MethodDescriptor::new::<dyn Silent>("ping").returns::<i32>())
        .unwrap();
    let log: Log = Arc::default();
    silent
        .add_advice(Trace::advice("pass", &log), Pointcut::all(), AdviceOrdering::new())
        .unwrap();

    let dispatcher = registry.dispatcher_for::<dyn Silent>(None);
    let fault = dispatcher
        .invoke_blocking::<i32>(ping, arguments![])
        .unwrap_err();
    match fault.downcast_ref::<DispatchError>() {
        Some(DispatchError::PipelineExhausted { chain, .. }) => assert_eq!(chain, &["pass"]),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(*log.lock(), vec!["pass:before", "pass:failed"]);
}

#[test]
fn advice_can_short_circuit_with_its_own_result() {
    trait Quote: Send + Sync {}

    struct Fixed;

    #[async_trait]
    impl Advice for Fixed {
        async fn handle(&self, _: &mut Invocation, _: Next<'_>) -> Result<Payload, Fault> {
            Ok(payload(42_i32))
        }
    }

    let registry = InterceptionRegistry::new();
    let quote = registry.configure_contract::<dyn Quote>().unwrap();
    let price = quote
        .declare(MethodDescriptor::new::<dyn Quote>("price").returns::<i32>())
        .unwrap();
    quote
        .add_advice(
            AdviceType::instance(AdviceId::of::<Fixed>(), Arc::new(Fixed)),
            Pointcut::all(),
            AdviceOrdering::new(),
        )
        .unwrap();
    let dispatcher = registry.dispatcher_for::<dyn Quote>(None);
    assert_eq!(dispatcher.invoke_blocking::<i32>(price, arguments![]).unwrap(), 42);
}

#[test]
fn proxy_values_persist_while_invocation_values_do_not() {
    struct Counter {
        seen: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    #[async_trait]
    impl Advice for Counter {
        async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
            let call = invocation.get_value::<usize>("calls.invocation").unwrap_or(0) + 1;
            invocation.set_value("calls.invocation", call);
            let proxy = invocation.get_value::<usize>("calls.proxy").unwrap_or(0) + 1;
            invocation.set_value_in(ValueScope::Proxy, "calls.proxy", proxy);
            self.seen.lock().push((call, proxy));
            next.proceed(invocation).await
        }
    }

    let (registry, methods) = calc_registry();
    let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::default();
    let contract = registry.contract_scope::<dyn Calc>().unwrap();
    registry
        .add_advice(
            &contract,
            AdviceType::instance(
                AdviceId::of::<Counter>(),
                Arc::new(Counter {
                    seen: Arc::clone(&seen),
                }),
            ),
            Pointcut::method_named("add"),
            AdviceOrdering::new(),
        )
        .unwrap();

    let first = proxy(&registry);
    first.add(1, 2);
    first.add(1, 2);
    let second = proxy(&registry);
    second.add(1, 2);
    assert_eq!(*seen.lock(), vec![(1, 1), (1, 2), (1, 1)]);

    seen.lock().clear();
    registry
        .register_proxy::<dyn Calc, _>(Lifetime::Scoped, move |dispatcher| {
            Arc::new(CalcProxy {
                dispatcher,
                methods,
            }) as Arc<dyn Calc>
        })
        .unwrap();
    let left = registry.container().create_child_scope();
    let right = registry.container().create_child_scope();
    left.get_required::<dyn Calc>().unwrap().add(1, 1);
    right.get_required::<dyn Calc>().unwrap().add(1, 1);
    left.get_required::<dyn Calc>().unwrap().add(1, 1);
    assert_eq!(*seen.lock(), vec![(1, 1), (1, 1), (1, 2)]);
}

#[test]
fn caller_identity_reaches_advices() {
    struct Tenant(&'static str);

    struct RecordTenant {
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Advice for RecordTenant {
        async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
            if let Some(tenant) = invocation.caller_as::<Tenant>() {
                self.seen.lock().push(tenant.0);
            }
            next.proceed(invocation).await
        }
    }

    let (registry, methods) = calc_registry();
    let seen = Arc::default();
    let contract = registry.contract_scope::<dyn Calc>().unwrap();
    registry
        .add_advice(
            &contract,
            AdviceType::instance(
                AdviceId::of::<RecordTenant>(),
                Arc::new(RecordTenant {
                    seen: Arc::clone(&seen),
                }),
            ),
            Pointcut::all(),
            AdviceOrdering::new(),
        )
        .unwrap();
    let dispatcher = registry
        .dispatcher_for::<dyn Calc>(Some(Arc::new(Calculator::default()) as Arc<dyn Calc>))
        .with_caller(Tenant("acme"));
    let sum: i32 = dispatcher.invoke_blocking(methods.add, arguments![4, 5]).unwrap();
    assert_eq!(sum, 9);
    assert_eq!(*seen.lock(), vec!["acme"]);
}

trait Relay: Send + Sync {
    fn relay(&self, a: i32, b: i32) -> String;
}

/// 经由代理调用 `Calc` 的同步实现。
struct Forwarder {
    calc: Arc<dyn Calc>,
}

impl Relay for Forwarder {
    fn relay(&self, a: i32, b: i32) -> String {
        let outer = current_invocation().expect("outer invocation");
        let sum = self.calc.add(a, b);
        let inner = self.calc.greet(String::from("inner"));
        let restored = current_invocation().expect("outer invocation restored");
        assert!(outer.same_as(&restored));
        format!("{}={sum}; {inner}", restored.method().name())
    }
}

struct RelayProxy(Dispatcher, MethodKey);

impl Relay for RelayProxy {
    fn relay(&self, a: i32, b: i32) -> String {
        self.0.invoke_blocking(self.1, arguments![a, b]).expect("relay")
    }
}

fn relay_registry() -> InterceptionRegistry {
    let (registry, _) = calc_registry();
    let relay = registry.configure_contract::<dyn Relay>().unwrap();
    let method = relay
        .method(
            MethodDescriptor::new::<dyn Relay>("relay")
                .param::<i32>("a")
                .param::<i32>("b")
                .returns::<String>(),
            |target, arguments| {
                let a = arguments.cloned::<i32>(0)?;
                let b = arguments.cloned::<i32>(1)?;
                Ok(ReturnValue::ready(target.relay(a, b)))
            },
        )
        .unwrap();
    relay
        .implementation_factory(Lifetime::Transient, |resolver| {
            Ok(Arc::new(Forwarder {
                calc: resolver.get_required::<dyn Calc>()?,
            }) as Arc<dyn Relay>)
        })
        .unwrap();
    registry
        .register_proxy::<dyn Relay, _>(Lifetime::Transient, move |dispatcher| {
            Arc::new(RelayProxy(dispatcher, method)) as Arc<dyn Relay>
        })
        .unwrap();
    registry
}

/// 首次轮询时自唤醒并挂起一次。
struct YieldOnce(bool);

impl std::future::Future for YieldOnce {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        if self.0 {
            return std::task::Poll::Ready(());
        }
        self.0 = true;
        cx.waker().wake_by_ref();
        std::task::Poll::Pending
    }
}

/// 在 `proceed` 之前真正挂起一次的通知。
struct Suspend {
    suspended: AtomicUsize,
}

#[async_trait]
impl Advice for Suspend {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("suspend")
    }

    async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
        YieldOnce(false).await;
        self.suspended.fetch_add(1, Ordering::SeqCst);
        next.proceed(invocation).await
    }
}

fn suspend_everywhere(registry: &InterceptionRegistry) -> Arc<Suspend> {
    let suspend = Arc::new(Suspend {
        suspended: AtomicUsize::new(0),
    });
    registry
        .add_advice(
            registry.global(),
            AdviceType::instance(AdviceId::of::<Suspend>(), Arc::clone(&suspend) as Arc<dyn Advice>),
            Pointcut::all(),
            AdviceOrdering::new(),
        )
        .unwrap();
    suspend
}

#[test]
fn nested_calls_restore_the_ambient_invocation() {
    let registry = relay_registry();
    assert!(current_invocation().is_none());
    let relay = registry.container().get_required::<dyn Relay>().unwrap();
    assert_eq!(relay.relay(2, 2), "relay=4; hello inner from greet");
    assert!(current_invocation().is_none());
}

#[test]
fn sync_calls_complete_through_suspending_advice() {
    let (registry, _) = calc_registry();
    let suspend = suspend_everywhere(&registry);
    let calc = proxy(&registry);
    assert_eq!(calc.add(2, 3), 5);
    calc.reset();
    assert_eq!(suspend.suspended.load(Ordering::SeqCst), 2);
}

#[test]
fn nested_sync_calls_survive_suspending_advice() {
    let registry = relay_registry();
    let suspend = suspend_everywhere(&registry);
    let relay = registry.container().get_required::<dyn Relay>().unwrap();
    assert_eq!(relay.relay(3, 3), "relay=6; hello inner from greet");
    assert_eq!(suspend.suspended.load(Ordering::SeqCst), 3);
    assert!(current_invocation().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_sync_calls_on_runtime_workers_survive_suspension() {
    let registry = relay_registry();
    suspend_everywhere(&registry);
    let relay = registry.container().get_required::<dyn Relay>().unwrap();
    let answer = tokio::spawn(async move { relay.relay(1, 4) }).await.unwrap();
    assert_eq!(answer, "relay=5; hello inner from greet");
}

#[test]
fn scoped_advices_follow_the_proxy_scope() {
    struct ScopedCounter {
        calls: AtomicUsize,
        seen: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl Advice for ScopedCounter {
        async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().push(call);
            next.proceed(invocation).await
        }
    }

    let (registry, methods) = calc_registry();
    let seen: Arc<Mutex<Vec<usize>>> = Arc::default();
    let shared = Arc::clone(&seen);
    registry
        .container()
        .add_scoped(move |_| {
            Ok(ScopedCounter {
                calls: AtomicUsize::new(0),
                seen: Arc::clone(&shared),
            })
        })
        .unwrap();
    let contract = registry.contract_scope::<dyn Calc>().unwrap();
    registry
        .add_advice(
            &contract,
            AdviceType::of::<ScopedCounter>(),
            Pointcut::method_named("add"),
            AdviceOrdering::new(),
        )
        .unwrap();
    registry
        .register_proxy::<dyn Calc, _>(Lifetime::Scoped, move |dispatcher| {
            Arc::new(CalcProxy {
                dispatcher,
                methods,
            }) as Arc<dyn Calc>
        })
        .unwrap();

    let left = registry.container().create_child_scope();
    let right = registry.container().create_child_scope();
    left.get_required::<dyn Calc>().unwrap().add(1, 1);
    right.get_required::<dyn Calc>().unwrap().add(1, 1);
    assert_eq!(*seen.lock(), vec![1, 1]);

    left.get_required::<dyn Calc>().unwrap().add(1, 1);
    assert_eq!(*seen.lock(), vec![1, 1, 2]);

    let left_advice = left.get_required::<ScopedCounter>().unwrap();
    let right_advice = right.get_required::<ScopedCounter>().unwrap();
    assert!(!Arc::ptr_eq(&left_advice, &right_advice));
    assert_eq!(left_advice.calls.load(Ordering::SeqCst), 2);
    assert_eq!(right_advice.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn proxies_outliving_their_scope_report_it() {
    let (registry, _) = calc_registry();
    let child = registry.container().create_child_scope();
    let calc = child.get_required::<dyn Calc>().unwrap();
    assert_eq!(calc.divide(8, 2).unwrap(), 4);

    drop(child);
    let fault = calc.divide(8, 2).unwrap_err();
    assert!(matches!(
        fault.downcast_ref::<DispatchError>(),
        Some(DispatchError::ScopeReleased { .. })
    ));
}

#[test]
fn replayed_chains_need_cloned_arguments() {
    struct Twice;

    #[async_trait]
    impl Advice for Twice {
        async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
            next.proceed(invocation).await?;
            next.proceed(invocation).await
        }
    }

    let (registry, _) = calc_registry();
    let contract = registry.contract_scope::<dyn Calc>().unwrap();
    registry
        .add_advice(
            &contract,
            AdviceType::instance(AdviceId::of::<Twice>(), Arc::new(Twice)),
            Pointcut::all(),
            AdviceOrdering::new(),
        )
        .unwrap();
    let calc = proxy(&registry);
    assert_eq!(calc.divide(9, 3).unwrap(), 3);

    let dispatcher = registry.dispatcher_for::<dyn Calc>(Some(Arc::new(Calculator::default()) as Arc<dyn Calc>));
    let greet = dispatcher.method("greet").unwrap();
    let fault = dispatcher
        .invoke_blocking::<String>(greet, arguments![String::from("twice")])
        .unwrap_err();
    assert!(matches!(
        fault.downcast_ref::<DispatchError>(),
        Some(DispatchError::ArgumentTaken { index: 0, .. })
    ));
}

#[tokio::test]
async fn async_contract_keeps_context_across_awaits() {
    let (registry, _) = calc_registry();
    let calc = proxy(&registry);
    assert_eq!(calc.add_later(20, 22).await.unwrap(), 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_calls_run_concurrently_on_a_runtime() {
    let (registry, _) = calc_registry();
    let calc = proxy(&registry);
    let handles: Vec<_> = (0..16)
        .map(|i| tokio::spawn(calc.add_later(i, 1)))
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), i as i32 + 1);
    }
}

#[test]
fn implementation_errors_surface_unchanged() {
    let (registry, _) = calc_registry();
    let log: Log = Arc::default();
    let contract = registry.contract_scope::<dyn Calc>().unwrap();
    registry
        .add_advice(&contract, Trace::advice("audit", &log), Pointcut::all(), AdviceOrdering::new())
        .unwrap();

    let calc = proxy(&registry);
    assert_eq!(calc.divide(9, 3).unwrap(), 3);
    let fault = calc.divide(1, 0).unwrap_err();
    assert!(fault.downcast_ref::<DivisionByZero>().is_some());
    assert_eq!(log.lock().last().map(String::as_str), Some("audit:failed"));
}

#[test]
fn void_methods_round_trip_through_the_pipeline() {
    let calculator = Arc::new(Calculator::default());
    let (registry, methods) = calc_registry();
    let dispatcher =
        registry.dispatcher_for::<dyn Calc>(Some(Arc::clone(&calculator) as Arc<dyn Calc>));
    dispatcher
        .invoke_blocking::<()>(methods.reset, arguments![])
        .unwrap();
    dispatcher
        .invoke_blocking::<()>(methods.reset, arguments![])
        .unwrap();
    assert_eq!(calculator.resets.load(Ordering::SeqCst), 2);

    let calc = proxy(&registry);
    calc.reset();
}

#[test]
fn wrong_argument_count_is_reported() {
    let (registry, methods) = calc_registry();
    let dispatcher = registry.dispatcher_for::<dyn Calc>(Some(Arc::new(Calculator::default()) as Arc<dyn Calc>));
    let fault = dispatcher
        .invoke_blocking::<i32>(methods.add, arguments![1])
        .unwrap_err();
    assert!(matches!(
        fault.downcast_ref::<DispatchError>(),
        Some(DispatchError::ArgumentCountMismatch {
            expected: 2,
            actual: 1,
            ..
        })
    ));
}

#[test]
fn cancellation_is_linked_to_caller_tokens() {
    struct CancelFirst;

    #[async_trait]
    impl Advice for CancelFirst {
        async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
            assert!(invocation.cancel());
            next.proceed(invocation).await
        }
    }

    let (registry, methods) = calc_registry();
    let calc = proxy(&registry);

    let cancelled = Cancellation::new();
    cancelled.cancel();
    assert!(calc.observe(cancelled));

    let token = Cancellation::new();
    assert!(!calc.observe(token.clone()));

    let scope = registry.method_scope(methods.observe).unwrap();
    registry
        .add_advice(
            &scope,
            AdviceType::instance(AdviceId::of::<CancelFirst>(), Arc::new(CancelFirst)),
            Pointcut::all(),
            AdviceOrdering::new(),
        )
        .unwrap();
    assert!(calc.observe(token.clone()));
    assert!(!token.is_cancelled());
}

#[test]
fn disabled_advice_is_left_out_of_the_chain() {
    let (registry, methods) = calc_registry();
    let log: Log = Arc::default();
    let contract = registry.contract_scope::<dyn Calc>().unwrap();
    registry
        .add_advice(&contract, Trace::advice("audit", &log), Pointcut::all(), AdviceOrdering::new())
        .unwrap();

    let add_scope = registry.method_scope(methods.add).unwrap();
    registry.set_value(&add_scope, "audit.Enabled", false, false);

    let calc = proxy(&registry);
    calc.add(1, 1);
    calc.greet(String::from("g"));
    assert_eq!(*log.lock(), vec!["audit:before", "audit:after"]);
    assert!(!registry
        .invocation_configuration(methods.add)
        .unwrap()
        .names()
        .contains(&String::from("audit")));
}

#[test]
fn method_scope_can_re_enable_what_the_module_disabled() {
    let (registry, methods) = calc_registry();
    let log: Log = Arc::default();
    let contract = registry.contract_scope::<dyn Calc>().unwrap();
    let module = contract.parent().unwrap();
    registry
        .add_advice(&module, Trace::advice("audit", &log), Pointcut::all(), AdviceOrdering::new())
        .unwrap();

    module.advice_config(ShapeId::new("audit")).set_enabled(false);
    registry
        .method_scope(methods.add)
        .unwrap()
        .advice_config(ShapeId::new("audit"))
        .set_enabled(true);
    registry.invalidate();

    let with_audit = registry.invocation_configuration(methods.add).unwrap();
    let without_audit = registry.invocation_configuration(methods.greet).unwrap();
    assert!(with_audit.names().contains(&String::from("audit")));
    assert!(!without_audit.names().contains(&String::from("audit")));
}

#[test]
fn ordering_cycles_fail_the_build() {
    let (registry, methods) = calc_registry();
    let log: Log = Arc::default();
    let contract = registry.contract_scope::<dyn Calc>().unwrap();
    registry
        .add_advice(&contract, Trace::advice("a", &log), Pointcut::all(), AdviceOrdering::new().before("b"))
        .unwrap();
    registry
        .add_advice(&contract, Trace::advice("b", &log), Pointcut::all(), AdviceOrdering::new().before("a"))
        .unwrap();

    match registry.invocation_configuration(methods.add) {
        Err(PipelineError::OrderingCycle { cycle, .. }) => assert_eq!(cycle, ["a", "b"]),
        other => panic!("unexpected build result: {other:?}"),
    }

    let dispatcher = registry.dispatcher_for::<dyn Calc>(Some(Arc::new(Calculator::default()) as Arc<dyn Calc>));
    let fault = dispatcher
        .invoke_blocking::<i32>(methods.add, arguments![1, 2])
        .unwrap_err();
    assert!(matches!(
        fault.downcast_ref::<DispatchError>(),
        Some(DispatchError::Pipeline(PipelineError::OrderingCycle { .. }))
    ));
    assert!(log.lock().is_empty());
}

#[test]
fn mandatory_shapes_must_be_configured() {
    struct Quota;

    #[async_trait]
    impl Advice for Quota {
        fn name(&self) -> Cow<'static, str> {
            Cow::Borrowed("quota")
        }

        fn shape(&self) -> ShapeId {
            ShapeId::new("quota").with_mandatory(true)
        }

        async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
            next.proceed(invocation).await
        }
    }

    let (registry, methods) = calc_registry();
    let contract = registry.contract_scope::<dyn Calc>().unwrap();
    registry
        .add_advice(
            &contract,
            AdviceType::instance(AdviceId::named("quota"), Arc::new(Quota)),
            Pointcut::all(),
            AdviceOrdering::new(),
        )
        .unwrap();

    match registry.invocation_configuration(methods.add) {
        Err(PipelineError::MissingConfiguration { shape, .. }) => assert_eq!(shape, "quota"),
        other => panic!("unexpected build result: {other:?}"),
    }

    registry.set_value(&contract, "quota.limit", 3_i64, false);
    let configuration = registry.invocation_configuration(methods.add).unwrap();
    assert!(configuration.names().contains(&String::from("quota")));
    registry.build_all().unwrap();
}

#[test]
fn foreign_method_keys_are_rejected() {
    trait Other: Send + Sync {}

    let (registry, methods) = calc_registry();
    let dispatcher = registry.dispatcher_for::<dyn Other>(None);
    let fault = dispatcher
        .invoke_blocking::<i32>(methods.add, arguments![1, 2])
        .unwrap_err();
    assert!(matches!(
        fault.downcast_ref::<DispatchError>(),
        Some(DispatchError::ForeignMethod { .. })
    ));
}

#[test]
#[traced_test]
fn pipeline_builds_are_logged() {
    let (registry, methods) = calc_registry();
    registry.invocation_configuration(methods.add).unwrap();
    assert!(logs_contain("advice pipeline built"));
}

#[test]
fn toml_overlay_disables_advice_for_one_method() {
    let (registry, _) = calc_registry();
    let log: Log = Arc::default();
    registry
        .add_advice(registry.global(), Trace::advice("audit", &log), Pointcut::all(), AdviceOrdering::new())
        .unwrap();
    let overlay = format!(
        "[method.\"{}\".add]\n\"audit.Enabled\" = false\n",
        std::any::type_name::<dyn Calc>()
    );
    registry.apply_toml(&overlay).unwrap();

    let calc = proxy(&registry);
    calc.add(1, 2);
    assert!(log.lock().is_empty());
    calc.greet(String::from("toml"));
    assert_eq!(log.lock().len(), 2);
}
