//! # Reentrant Drain Loop
//!
//! Operations called from inside callbacks are queued behind the current
//! delivery instead of nesting, so follow-up events arrive in call order and
//! objects may register or unregister each other mid-delivery.

#[cfg(test)]
mod tests {
    use crate::fixtures::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use switchyard::{BindingsBuilder, Bus, BusError, BusObject, Mode};

    fn bus() -> Bus {
        Bus::with_depot(isolated_depot("reentrancy"))
    }

    /// On each `Ping`, posts the configured fan-out of child pings.
    struct FanOut {
        children: Vec<Vec<u32>>,
        journal: Journal,
        depth: AtomicUsize,
        max_depth: AtomicUsize,
    }

    impl FanOut {
        fn new(children: Vec<Vec<u32>>) -> Arc<Self> {
            Arc::new(Self {
                children,
                journal: Journal::new(),
                depth: AtomicUsize::new(0),
                max_depth: AtomicUsize::new(0),
            })
        }
    }

    impl BusObject for FanOut {
        fn bindings(bindings: &mut BindingsBuilder<Self>) {
            bindings.subscribe_with_bus(Mode::Main, |this: &FanOut, ping: &Ping, bus: &Bus| {
                let depth = this.depth.fetch_add(1, Ordering::SeqCst) + 1;
                this.max_depth.fetch_max(depth, Ordering::SeqCst);
                this.journal.record(ping.0.to_string());

                if let Some(children) = this.children.get(ping.0 as usize) {
                    for child in children {
                        bus.post(Ping(*child))?;
                    }
                }
                this.depth.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
    }

    /// Breadth-first order of a fan-out tree rooted at node 0.
    fn breadth_first(children: &[Vec<u32>]) -> Vec<String> {
        let mut order = Vec::new();
        let mut queue = std::collections::VecDeque::from([0_u32]);
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            if let Some(next) = children.get(node as usize) {
                queue.extend(next.iter().copied());
            }
        }
        order
    }

    #[test]
    fn test_nested_posts_are_breadth_first() {
        let tree = vec![vec![1, 2], vec![3], vec![4, 5], vec![], vec![], vec![]];
        let bus = bus();
        let fan_out = FanOut::new(tree.clone());
        bus.register(&fan_out).unwrap();

        bus.post(Ping(0)).unwrap();
        assert_eq!(fan_out.journal.take(), breadth_first(&tree));
        assert_eq!(fan_out.max_depth.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_long_chains_do_not_grow_the_stack() {
        // Node n posts n + 1: a chain far deeper than recursion could survive
        let tree: Vec<Vec<u32>> = (1..=20_000).map(|n| vec![n]).collect();
        let bus = bus();
        let fan_out = FanOut::new(tree);
        bus.register(&fan_out).unwrap();

        bus.post(Ping(0)).unwrap();
        assert_eq!(fan_out.journal.len(), 20_001);
        assert_eq!(fan_out.max_depth.load(Ordering::SeqCst), 1);
    }

    /// Builds a random tree: every node after the root picks an earlier
    /// parent, children are posted in node order.
    fn tree_strategy() -> impl Strategy<Value = Vec<Vec<u32>>> {
        (1_usize..40).prop_flat_map(|size| {
            proptest::collection::vec(any::<proptest::sample::Index>(), size - 1).prop_map(
                move |parents| {
                    let mut children = vec![Vec::new(); size];
                    for (offset, parent) in parents.iter().enumerate() {
                        let node = offset + 1;
                        children[parent.index(node)].push(node as u32);
                    }
                    children
                },
            )
        })
    }

    proptest! {
        #[test]
        fn prop_follow_up_posts_keep_fifo_order(tree in tree_strategy()) {
            let bus = bus();
            let fan_out = FanOut::new(tree.clone());
            bus.register(&fan_out).unwrap();

            bus.post(Ping(0)).unwrap();
            prop_assert_eq!(fan_out.journal.take(), breadth_first(&tree));
            prop_assert_eq!(fan_out.max_depth.load(Ordering::SeqCst), 1);
        }
    }

    /// Unregisters itself on the first ping and records whether the bus
    /// still saw it as registered inside the callback.
    #[derive(Default)]
    struct Quitter {
        journal: Journal,
        me: parking_lot::Mutex<Option<Arc<Quitter>>>,
    }

    impl BusObject for Quitter {
        fn bindings(bindings: &mut BindingsBuilder<Self>) {
            bindings.subscribe_with_bus(Mode::Main, |this: &Quitter, ping: &Ping, bus: &Bus| {
                this.journal.record(format!("ping {}", ping.0));
                if let Some(me) = this.me.lock().take() {
                    bus.unregister(&me)?;
                    this.journal
                        .record(format!("still registered {}", bus.has_registered(&me)?));
                    bus.post(Ping(ping.0 + 1))?;
                }
                Ok(())
            });
        }
    }

    #[test]
    fn test_self_unregistration_applies_after_callback() {
        let bus = bus();
        let quitter = Arc::new(Quitter::default());
        *quitter.me.lock() = Some(quitter.clone());
        let witness = PingRecorder::new();
        bus.register(&quitter).unwrap();
        bus.register(&witness).unwrap();

        bus.post(Ping(1)).unwrap();

        // The follow-up ping is queued behind the unregister task
        assert_eq!(
            quitter.journal.take(),
            vec!["ping 1", "still registered true"]
        );
        assert_eq!(witness.journal.take(), vec!["ping 1", "ping 2"]);
        assert!(!bus.has_registered(&quitter).unwrap());
    }

    /// Registers a fresh recorder for every ping it sees.
    #[derive(Default)]
    struct Spawner {
        spawned: parking_lot::Mutex<Vec<Arc<PingRecorder>>>,
    }

    impl BusObject for Spawner {
        fn bindings(bindings: &mut BindingsBuilder<Self>) {
            bindings.subscribe_with_bus(Mode::Main, |this: &Spawner, ping: &Ping, bus: &Bus| {
                if ping.0 < 3 {
                    let child = PingRecorder::new();
                    bus.register(&child)?;
                    this.spawned.lock().push(child);
                    bus.post(Ping(ping.0 + 1))?;
                }
                Ok(())
            });
        }
    }

    #[test]
    fn test_registration_during_delivery_does_not_disturb_iteration() {
        let bus = bus();
        let spawner = Arc::new(Spawner::default());
        bus.register(&spawner).unwrap();

        bus.post(Ping(0)).unwrap();

        let spawned = spawner.spawned.lock();
        assert_eq!(spawned.len(), 3);
        // Each child sees only the pings posted after its registration
        assert_eq!(spawned[0].journal.snapshot(), vec!["ping 1", "ping 2", "ping 3"]);
        assert_eq!(spawned[1].journal.snapshot(), vec!["ping 2", "ping 3"]);
        assert_eq!(spawned[2].journal.snapshot(), vec!["ping 3"]);
    }

    /// Fails on odd pings after posting a pong.
    #[derive(Default)]
    struct OddFailer {
        journal: Journal,
    }

    impl BusObject for OddFailer {
        fn bindings(bindings: &mut BindingsBuilder<Self>) {
            bindings
                .subscribe_with_bus(Mode::Main, |this: &OddFailer, ping: &Ping, bus: &Bus| {
                    this.journal.record(format!("ping {}", ping.0));
                    bus.post(Pong(ping.0))?;
                    anyhow::ensure!(ping.0 % 2 == 0, "odd ping {}", ping.0);
                    Ok(())
                })
                .subscribe(|this: &OddFailer, pong: &Pong| {
                    this.journal.record(format!("pong {}", pong.0));
                    Ok(())
                });
        }
    }

    #[test]
    fn test_failure_reaches_outermost_caller_and_queue_drains_later() {
        let bus = bus();
        let failer = Arc::new(OddFailer::default());
        bus.register(&failer).unwrap();

        let err = bus.post(Ping(1)).unwrap_err();
        assert!(matches!(err, BusError::CallbackFailure { .. }));
        assert_eq!(
            format!("{:#}", anyhow::Error::from(err)),
            format!(
                "{} failed handling {}: odd ping 1",
                std::any::type_name::<OddFailer>(),
                std::any::type_name::<Ping>()
            )
        );

        bus.post(Ping(2)).unwrap();
        assert_eq!(
            failer.journal.take(),
            vec!["ping 1", "pong 1", "ping 2", "pong 2"]
        );
    }
}
