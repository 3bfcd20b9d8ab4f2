//! # Routing and Registration
//!
//! Exact-type delivery, producer priming in both registration orders, and
//! the registration error paths.

#[cfg(test)]
mod tests {
    use crate::fixtures::*;
    use std::sync::Arc;
    use switchyard::{BindingsBuilder, Bus, BusError, BusObject, Role};

    fn bus() -> Bus {
        Bus::with_depot(isolated_depot("routing"))
    }

    /// Subscribes to a wrapper type only.
    #[derive(Default)]
    struct BoxedPingRecorder {
        journal: Journal,
    }

    impl BusObject for BoxedPingRecorder {
        fn bindings(bindings: &mut BindingsBuilder<Self>) {
            bindings.subscribe(|this: &BoxedPingRecorder, ping: &Box<Ping>| {
                this.journal.record(format!("boxed {}", ping.0));
                Ok(())
            });
        }
    }

    #[test]
    fn test_delivery_is_by_exact_type() {
        let bus = bus();
        let plain = PingRecorder::new();
        let boxed = Arc::new(BoxedPingRecorder::default());
        bus.register(&plain).unwrap();
        bus.register(&boxed).unwrap();

        bus.post(Ping(1)).unwrap();
        bus.post(Box::new(Ping(2))).unwrap();
        bus.post(Pong(3)).unwrap();

        assert_eq!(plain.journal.take(), vec!["ping 1"]);
        assert_eq!(boxed.journal.take(), vec!["boxed 2"]);
    }

    #[test]
    fn test_every_subscriber_receives_each_event() {
        let bus = bus();
        let recorders: Vec<_> = (0..4).map(|_| PingRecorder::new()).collect();
        for recorder in &recorders {
            bus.register(recorder).unwrap();
        }
        assert_eq!(bus.subscriber_count::<Ping>(), 4);

        bus.post(Ping(8)).unwrap();
        for recorder in &recorders {
            assert_eq!(recorder.journal.take(), vec!["ping 8"]);
        }
        assert_eq!(bus.stats().delivered, 4);
    }

    #[test]
    fn test_single_receiver_sees_post_order() {
        let bus = bus();
        let recorder = PingRecorder::new();
        bus.register(&recorder).unwrap();

        for n in 0..50 {
            bus.post(Ping(n)).unwrap();
        }
        let expected: Vec<String> = (0..50).map(|n| format!("ping {n}")).collect();
        assert_eq!(recorder.journal.take(), expected);
    }

    #[test]
    fn test_producer_then_subscriber() {
        let bus = bus();
        bus.register(&BatteryMonitor::new(Some(80))).unwrap();

        let indicator = BatteryIndicator::new();
        bus.register(&indicator).unwrap();
        assert_eq!(indicator.journal.take(), vec!["battery 80"]);
    }

    #[test]
    fn test_subscriber_then_producer() {
        let bus = bus();
        let first = BatteryIndicator::new();
        let second = BatteryIndicator::new();
        bus.register(&first).unwrap();
        bus.register(&second).unwrap();

        bus.register(&BatteryMonitor::new(Some(42))).unwrap();
        assert_eq!(first.journal.take(), vec!["battery 42"]);
        assert_eq!(second.journal.take(), vec!["battery 42"]);
    }

    #[test]
    fn test_unknown_value_primes_nothing() {
        let bus = bus();
        let indicator = BatteryIndicator::new();
        bus.register(&indicator).unwrap();
        bus.register(&BatteryMonitor::new(None)).unwrap();
        assert!(indicator.journal.is_empty());
    }

    #[test]
    fn test_producer_is_asked_on_each_registration() {
        let bus = bus();
        let monitor = BatteryMonitor::new(Some(10));
        bus.register(&monitor).unwrap();

        let early = BatteryIndicator::new();
        bus.register(&early).unwrap();

        *monitor.level.lock() = Some(11);
        let late = BatteryIndicator::new();
        bus.register(&late).unwrap();

        assert_eq!(early.journal.take(), vec!["battery 10"]);
        assert_eq!(late.journal.take(), vec!["battery 11"]);
    }

    /// Produces and consumes the same type.
    #[derive(Default)]
    struct Echo {
        journal: Journal,
    }

    impl BusObject for Echo {
        fn bindings(bindings: &mut BindingsBuilder<Self>) {
            bindings
                .subscribe(|this: &Echo, level: &BatteryLevel| {
                    this.journal.record(format!("echo {}", level.0));
                    Ok(())
                })
                .produce(|_this: &Echo| Some(BatteryLevel(99)));
        }
    }

    #[test]
    fn test_self_consistent_object_is_primed_once() {
        let bus = bus();
        let indicator = BatteryIndicator::new();
        bus.register(&indicator).unwrap();

        let echo = Arc::new(Echo::default());
        bus.register(&echo).unwrap();

        assert_eq!(echo.journal.take(), vec!["echo 99"]);
        assert_eq!(indicator.journal.take(), vec!["battery 99"]);
    }

    #[test]
    fn test_second_producer_is_rejected() {
        let bus = bus();
        bus.register(&BatteryMonitor::new(Some(1))).unwrap();

        let err = bus.register(&BatteryMonitor::new(Some(2))).unwrap_err();
        assert!(matches!(
            err,
            BusError::DuplicateRegistration {
                role: Role::Producer,
                ..
            }
        ));
    }

    #[test]
    fn test_double_registration_is_rejected() {
        let bus = bus();
        let recorder = PingRecorder::new();
        bus.register(&recorder).unwrap();
        assert!(matches!(
            bus.register(&recorder),
            Err(BusError::DuplicateRegistration {
                role: Role::Subscriber,
                ..
            })
        ));

        // Another instance of the same type is a different object
        bus.register(&PingRecorder::new()).unwrap();
        assert_eq!(bus.subscriber_count::<Ping>(), 2);
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let bus = bus();
        let recorder = PingRecorder::new();
        bus.register(&recorder).unwrap();
        bus.post(Ping(1)).unwrap();

        bus.unregister(&recorder).unwrap();
        assert!(!bus.has_registered(&recorder).unwrap());
        bus.post(Ping(2)).unwrap();

        assert_eq!(recorder.journal.take(), vec!["ping 1"]);
        assert!(matches!(
            bus.unregister(&recorder),
            Err(BusError::NotRegistered { .. })
        ));
    }

    #[test]
    fn test_reregister_after_unregister() {
        let bus = bus();
        let monitor = BatteryMonitor::new(Some(5));
        bus.register(&monitor).unwrap();
        bus.unregister(&monitor).unwrap();
        assert!(!bus.has_producer::<BatteryLevel>());

        bus.register(&monitor).unwrap();
        assert!(bus.has_producer::<BatteryLevel>());
    }

    /// Rejects battery levels below ten.
    #[derive(Default)]
    struct LowBatteryAlarm {
        journal: Journal,
    }

    impl BusObject for LowBatteryAlarm {
        fn bindings(bindings: &mut BindingsBuilder<Self>) {
            bindings.subscribe(|this: &LowBatteryAlarm, level: &BatteryLevel| {
                anyhow::ensure!(level.0 >= 10, "battery critical at {}", level.0);
                this.journal.record(format!("battery {}", level.0));
                Ok(())
            });
        }
    }

    #[test]
    fn test_priming_failure_keeps_the_registration() {
        let bus = bus();
        let monitor = BatteryMonitor::new(Some(3));
        bus.register(&monitor).unwrap();

        let alarm = Arc::new(LowBatteryAlarm::default());
        assert!(matches!(
            bus.register(&alarm),
            Err(BusError::CallbackFailure { .. })
        ));
        assert!(bus.has_registered(&alarm).unwrap());
        assert_eq!(bus.subscriber_count::<BatteryLevel>(), 1);
        assert!(matches!(
            bus.register(&alarm),
            Err(BusError::DuplicateRegistration {
                role: Role::Subscriber,
                ..
            })
        ));

        // Rolling back is the caller's unregister
        bus.unregister(&alarm).unwrap();
        bus.unregister(&monitor).unwrap();
        bus.register(&alarm).unwrap();
        bus.post(BatteryLevel(40)).unwrap();
        assert_eq!(alarm.journal.take(), vec!["battery 40"]);
    }

    /// Declares two subscribers for one type.
    struct Conflicted;

    impl BusObject for Conflicted {
        fn bindings(bindings: &mut BindingsBuilder<Self>) {
            bindings
                .subscribe(|_this: &Conflicted, _ping: &Ping| Ok(()))
                .subscribe(|_this: &Conflicted, _ping: &Ping| Ok(()));
        }
    }

    #[test]
    fn test_conflicting_bindings_fail_every_time() {
        let bus = bus();
        let object = Arc::new(Conflicted);
        for _ in 0..2 {
            assert!(matches!(
                bus.register(&object),
                Err(BusError::BindingConflict { .. })
            ));
        }
        assert_eq!(bus.subscriber_count::<Ping>(), 0);
    }

    #[test]
    fn test_buses_are_independent() {
        let depot = isolated_depot("routing-shared");
        let left = Bus::with_depot(depot.clone());
        let right = Bus::with_depot(depot);
        let recorder = PingRecorder::new();

        left.register(&recorder).unwrap();
        right.register(&recorder).unwrap();
        left.post(Ping(1)).unwrap();

        assert_eq!(recorder.journal.take(), vec!["ping 1"]);
        assert_eq!(right.stats().posted, 0);
    }
}
