//! # ordering 模块说明
//!
//! ## 角色定位（Why）
//! - 通知在不同作用域独立声明，彼此只通过 `before`/`after` 约束表达先后关系，
//!   需要一个确定性的拓扑排序把它们排成一条链。
//!
//! ## 行为契约（What）
//! - Kahn 算法；多个节点同时可选时取注册序号最小者；
//! - 约束指向未收集到的通知时忽略；
//! - 存在环（含自引用）时返回 [`PipelineError::OrderingCycle`]，列出环上及受其阻塞的通知；
//! - 保留的实现分发通知不参与排序，总是追加在末尾。

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use crate::{advice::AdviceRegistration, error::PipelineError};

/// 对已收集的注册排序。
pub(crate) fn order(
    method: &str,
    registrations: Vec<AdviceRegistration>,
) -> Result<Vec<AdviceRegistration>, PipelineError> {
    let (dispatch, nodes): (Vec<_>, Vec<_>) = registrations
        .into_iter()
        .partition(|registration| registration.id().is_implementation_dispatch());

    let index: HashMap<_, _> = nodes
        .iter()
        .enumerate()
        .map(|(position, registration)| (registration.id().clone(), position))
        .collect();

    let mut edges = vec![Vec::new(); nodes.len()];
    let mut incoming = vec![0_usize; nodes.len()];
    for (from, registration) in nodes.iter().enumerate() {
        for target in registration.ordering().before_ids() {
            if let Some(&to) = index.get(target) {
                edges[from].push(to);
                incoming[to] += 1;
            }
        }
        for source in registration.ordering().after_ids() {
            if let Some(&before) = index.get(source) {
                edges[before].push(from);
                incoming[from] += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(u64, usize)>> = incoming
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(position, _)| Reverse((nodes[position].sequence(), position)))
        .collect();

    let mut sorted = Vec::with_capacity(nodes.len() + dispatch.len());
    while let Some(Reverse((_, position))) = ready.pop() {
        sorted.push(position);
        for &next in &edges[position] {
            incoming[next] -= 1;
            if incoming[next] == 0 {
                ready.push(Reverse((nodes[next].sequence(), next)));
            }
        }
    }

    if sorted.len() < nodes.len() {
        let mut blocked: Vec<&AdviceRegistration> = incoming
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(position, _)| &nodes[position])
            .collect();
        blocked.sort_by_key(|registration| registration.sequence());
        return Err(PipelineError::OrderingCycle {
            method: method.to_owned(),
            cycle: blocked
                .iter()
                .map(|registration| registration.id().to_string())
                .collect(),
        });
    }

    let mut slots: Vec<Option<AdviceRegistration>> = nodes.into_iter().map(Some).collect();
    let mut ordered: Vec<AdviceRegistration> = sorted
        .into_iter()
        .filter_map(|position| slots[position].take())
        .collect();
    ordered.extend(dispatch.into_iter().take(1));
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use std::{borrow::Cow, sync::Arc};

    use async_trait::async_trait;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        advice::{Advice, AdviceId, AdviceOrdering, AdviceType, Next, Pointcut},
        dispatch::result::Payload,
        error::Fault,
        invocation::Invocation,
    };

    struct Named(&'static str);

    #[async_trait]
    impl Advice for Named {
        fn name(&self) -> Cow<'static, str> {
            Cow::Borrowed(self.0)
        }

        async fn handle(&self, invocation: &mut Invocation, next: Next<'_>) -> Result<Payload, Fault> {
            next.proceed(invocation).await
        }
    }

    fn registration(name: &'static str, ordering: AdviceOrdering, sequence: u64) -> AdviceRegistration {
        AdviceRegistration::new(
            AdviceType::instance(AdviceId::named(name), Arc::new(Named(name))),
            Pointcut::all(),
            ordering,
            sequence,
        )
    }

    fn names(ordered: &[AdviceRegistration]) -> Vec<String> {
        ordered.iter().map(|registration| registration.id().to_string()).collect()
    }

    #[test]
    fn ties_follow_registration_sequence() {
        let ordered = order(
            "t::m",
            vec![
                registration("b", AdviceOrdering::new(), 2),
                registration("a", AdviceOrdering::new(), 1),
                registration("c", AdviceOrdering::new(), 3),
            ],
        )
        .unwrap();
        assert_eq!(names(&ordered), vec!["a", "b", "c"]);
    }

    #[test]
    fn dispatch_is_always_last_and_unknown_ids_are_ignored() {
        let ordered = order(
            "t::m",
            vec![
                registration(
                    crate::advice::IMPLEMENTATION_DISPATCH,
                    AdviceOrdering::new(),
                    0,
                ),
                registration("late", AdviceOrdering::new().before("missing"), 9),
                registration("early", AdviceOrdering::new(), 5),
            ],
        )
        .unwrap();
        assert_eq!(
            names(&ordered),
            vec!["early", "late", crate::advice::IMPLEMENTATION_DISPATCH]
        );
    }

    #[test]
    fn contradictory_constraints_report_a_cycle() {
        let error = order(
            "t::m",
            vec![
                registration("a", AdviceOrdering::new().before("b"), 1),
                registration("b", AdviceOrdering::new().before("a"), 2),
                registration("free", AdviceOrdering::new(), 3),
            ],
        )
        .unwrap_err();
        match error {
            PipelineError::OrderingCycle { method, cycle } => {
                assert_eq!(method, "t::m");
                assert_eq!(cycle, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let error = order(
            "t::m",
            vec![registration("a", AdviceOrdering::new().after("a"), 1)],
        )
        .unwrap_err();
        assert!(matches!(error, PipelineError::OrderingCycle { .. }));
    }

    proptest! {
        #[test]
        fn constraints_win_over_registration_order(sequences in Just(vec![1_u64, 2, 3]).prop_shuffle()) {
            let ordered = order(
                "t::m",
                vec![
                    registration("C", AdviceOrdering::new(), sequences[0]),
                    registration("B", AdviceOrdering::new().after("A").before("C"), sequences[1]),
                    registration("A", AdviceOrdering::new().before("C"), sequences[2]),
                ],
            )
            .unwrap();
            prop_assert_eq!(names(&ordered), vec!["A", "B", "C"]);
        }
    }
}
