//! Property-based tests for the effect runtime.
//!
//! Uses proptest to generate random effect trees and streams and verify
//! the interpreter's invariants hold.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use monix::{Error, Iterant, Task, TrampolineScheduler};
use proptest::prelude::*;

fn run_now<A: Send + 'static>(task: &Task<A>) -> Result<A, Error> {
    task.run(Arc::new(TrampolineScheduler::default()))
        .try_take()
        .expect("task did not complete synchronously")
}

/// A recipe for building a small effect tree over i64.
#[derive(Debug, Clone)]
enum TaskStep {
    MapAdd(i64),
    BindAdd(i64),
    BindFail,
    Recover(i64),
}

fn task_step() -> impl Strategy<Value = TaskStep> {
    prop_oneof![
        (-100i64..100).prop_map(TaskStep::MapAdd),
        (-100i64..100).prop_map(TaskStep::BindAdd),
        Just(TaskStep::BindFail),
        (-100i64..100).prop_map(TaskStep::Recover),
    ]
}

/// Build a task from a seed and steps, plus the expected outcome.
fn build_task(seed: i64, steps: &[TaskStep]) -> (Task<i64>, Result<i64, ()>) {
    let mut task = Task::pure(seed);
    let mut expected: Result<i64, ()> = Ok(seed);
    for step in steps {
        match step {
            TaskStep::MapAdd(n) => {
                let n = *n;
                task = task.map(move |x| x + n);
                expected = expected.map(|x| x + n);
            }
            TaskStep::BindAdd(n) => {
                let n = *n;
                task = task.flat_map(move |x| Task::pure(x + n));
                expected = expected.map(|x| x + n);
            }
            TaskStep::BindFail => {
                task = task.flat_map(|_| Task::raise(Error::msg("injected")));
                expected = expected.and(Err(()));
            }
            TaskStep::Recover(n) => {
                let n = *n;
                task = task.on_error_handle_with(move |_| Task::pure(n));
                if expected.is_err() {
                    expected = Ok(n);
                }
            }
        }
    }
    (task, expected)
}

proptest! {
    /// The callback is invoked exactly once with a single outcome.
    #[test]
    fn callback_invoked_exactly_once(seed in -1000i64..1000, steps in prop::collection::vec(task_step(), 0..20)) {
        let (task, _) = build_task(seed, &steps);
        let invocations = Arc::new(AtomicUsize::new(0));
        let i = invocations.clone();
        let ctx = Arc::new(monix::Context::new(
            Arc::new(TrampolineScheduler::default()),
            monix::Options::default(),
        ));
        task.run_with_callback(&ctx, move |_| {
            i.fetch_add(1, Ordering::SeqCst);
        });
        prop_assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    /// Random trees evaluate to their reference outcome.
    #[test]
    fn interpreter_matches_reference(seed in -1000i64..1000, steps in prop::collection::vec(task_step(), 0..20)) {
        let (task, expected) = build_task(seed, &steps);
        match (run_now(&task), expected) {
            (Ok(actual), Ok(reference)) => prop_assert_eq!(actual, reference),
            (Err(_), Err(())) => {}
            (actual, reference) => {
                return Err(TestCaseError::fail(format!(
                    "outcome mismatch: {:?} vs {:?}",
                    actual.is_ok(),
                    reference.is_ok()
                )));
            }
        }
    }

    /// Stack depth stays bounded no matter how deep the bind recursion is.
    #[test]
    fn bind_chains_are_stack_safe(depth in 1u64..100_000) {
        fn count_up(x: u64, limit: u64) -> Task<u64> {
            if x == limit {
                Task::pure(x)
            } else {
                Task::defer(move || Task::pure(x + 1)).flat_map(move |n| count_up(n, limit))
            }
        }
        prop_assert_eq!(run_now(&count_up(0, depth)).unwrap(), depth);
    }

    /// Monad laws, observationally.
    #[test]
    fn monad_left_identity(a in -1000i64..1000, n in -1000i64..1000) {
        let f = move |x: i64| Task::pure(x + n);
        let lhs = Task::pure(a).flat_map(f);
        let rhs = f(a);
        prop_assert_eq!(run_now(&lhs).unwrap(), run_now(&rhs).unwrap());
    }

    #[test]
    fn monad_right_identity(a in -1000i64..1000) {
        let m = Task::pure(a);
        let lhs = m.flat_map(Task::pure);
        prop_assert_eq!(run_now(&lhs).unwrap(), run_now(&m).unwrap());
    }

    #[test]
    fn monad_associativity(a in -100i64..100, n in -100i64..100, k in -100i64..100) {
        let m = Task::pure(a);
        let f = move |x: i64| Task::pure(x + n);
        let g = move |x: i64| Task::pure(x * k);
        let lhs = m.flat_map(f).flat_map(g);
        let rhs = m.flat_map(move |x| f(x).flat_map(g));
        prop_assert_eq!(run_now(&lhs).unwrap(), run_now(&rhs).unwrap());
    }

    /// Scopes balance acquire and release on every termination path.
    #[test]
    fn scope_acquire_equals_release(
        items in prop::collection::vec(0i64..100, 0..20),
        take_n in 0usize..25,
        fail_acquire in any::<bool>(),
    ) {
        let acquires = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let a = acquires.clone();
        let r = releases.clone();

        let acquire = if fail_acquire {
            Task::<()>::raise(Error::msg("acquire failed"))
        } else {
            Task::eval(move || {
                a.fetch_add(1, Ordering::SeqCst);
            })
        };
        let items2 = items.clone();
        let stream = Iterant::scope(
            acquire,
            move |_res| Iterant::from_vec(items2.clone()),
            move |_res, _exit| {
                let r = r.clone();
                Task::eval(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                })
            },
        );

        let _ = run_now(&stream.take(take_n).to_vec());

        let acquired = acquires.load(Ordering::SeqCst);
        let released = releases.load(Ordering::SeqCst);
        prop_assert_eq!(acquired, released);
        if fail_acquire || take_n == 0 {
            // take(0) never visits the scope; a failed acquire opens nothing.
            prop_assert_eq!(acquired, 0);
        } else {
            prop_assert_eq!(acquired, 1);
        }
    }

    /// attempt(raise(e)) yields exactly one Err element, then completes.
    #[test]
    fn attempt_of_raise_is_single_err(message in "[a-z]{1,12}") {
        let stream = Iterant::<i64>::raise_error(Error::msg(message)).attempt();
        let items = run_now(&stream.to_vec()).unwrap();
        prop_assert_eq!(items.len(), 1);
        prop_assert!(items[0].is_err());
    }

    /// drop_while_with_index emits exactly the suffix from the first index
    /// where the predicate fails, order preserved.
    #[test]
    fn drop_while_with_index_matches_reference(
        items in prop::collection::vec(-50i64..50, 0..60),
        threshold in -50i64..50,
        index_bound in 0usize..60,
    ) {
        let predicate = move |x: &i64, i: usize| *x < threshold || i < index_bound;

        let mut cut = items.len();
        for (i, x) in items.iter().enumerate() {
            if !predicate(x, i) {
                cut = i;
                break;
            }
        }
        let expected: Vec<i64> = items[cut..].to_vec();

        let stream = Iterant::from_vec(items.clone()).drop_while_with_index(predicate);
        prop_assert_eq!(run_now(&stream.to_vec()).unwrap(), expected);
    }

    /// A memoized producer runs at most once on the success path.
    #[test]
    fn memoized_producer_runs_once(value in -1000i64..1000, runs in 1usize..6) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let i = invocations.clone();
        let task = Task::eval(move || {
            i.fetch_add(1, Ordering::SeqCst);
            value
        })
        .memoize();
        for _ in 0..runs {
            prop_assert_eq!(run_now(&task).unwrap(), value);
        }
        prop_assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    /// Without error caching, each observed failure re-arms the producer.
    #[test]
    fn memoize_on_success_reruns_per_failure(failures in 0usize..4) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let i = invocations.clone();
        let task = Task::eval_result(move || {
            let n = i.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err(Error::msg("not yet"))
            } else {
                Ok(n)
            }
        })
        .memoize_on_success();

        for _ in 0..failures {
            prop_assert!(run_now(&task).is_err());
        }
        prop_assert_eq!(run_now(&task).unwrap(), failures);
        // Once cached, further runs do not re-invoke.
        prop_assert_eq!(run_now(&task).unwrap(), failures);
        prop_assert_eq!(invocations.load(Ordering::SeqCst), failures + 1);
    }
}
