//! # Host Lifecycle
//!
//! Wired adapters follow the owner's start/stop transitions; destroying the
//! owner stops them, cancels delayed events and unbinds the context.

#[cfg(test)]
mod tests {
    use crate::fixtures::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;
    use switchyard::{BindingsBuilder, Bus, BusObject, Wireable};

    const WAIT: Duration = Duration::from_secs(5);

    /// Reports the link as up on start and down on stop.
    struct LinkAdapter {
        journal: Journal,
    }

    impl Wireable for LinkAdapter {
        fn on_start(&mut self, bus: &Bus) -> anyhow::Result<()> {
            self.journal.record("start");
            bus.post(Connectivity { online: true })?;
            Ok(())
        }

        fn on_stop(&mut self, bus: &Bus) -> anyhow::Result<()> {
            self.journal.record("stop");
            bus.post(Connectivity { online: false })?;
            Ok(())
        }

        fn name(&self) -> &str {
            "link"
        }
    }

    /// Refuses to start.
    struct BrokenAdapter {
        journal: Journal,
    }

    impl Wireable for BrokenAdapter {
        fn on_start(&mut self, _bus: &Bus) -> anyhow::Result<()> {
            self.journal.record("start attempt");
            anyhow::bail!("sensor unavailable")
        }

        fn on_stop(&mut self, _bus: &Bus) -> anyhow::Result<()> {
            self.journal.record("stop");
            Ok(())
        }
    }

    #[derive(Default)]
    struct LinkWatcher {
        journal: Journal,
    }

    impl BusObject for LinkWatcher {
        fn bindings(bindings: &mut BindingsBuilder<Self>) {
            bindings.subscribe(|this: &LinkWatcher, change: &Connectivity| {
                this.journal.record(format!("online {}", change.online));
                Ok(())
            });
        }
    }

    fn bus_with_watcher(prefix: &str) -> (Bus, Arc<LinkWatcher>) {
        let bus = Bus::with_context(isolated_context(prefix));
        let watcher = Arc::new(LinkWatcher::default());
        bus.register(&watcher).unwrap();
        (bus, watcher)
    }

    #[test]
    fn test_adapters_follow_start_and_stop() {
        let (bus, watcher) = bus_with_watcher("life-start-stop");
        let adapter = Journal::new();
        bus.wire(LinkAdapter {
            journal: adapter.clone(),
        });
        assert_eq!(bus.wired(), 1);
        assert!(adapter.is_empty());

        bus.on_owner_start();
        bus.on_owner_start();
        assert!(bus.is_started());
        assert_eq!(adapter.snapshot(), vec!["start"]);
        assert_eq!(watcher.journal.take(), vec!["online true"]);

        bus.on_owner_stop();
        bus.on_owner_stop();
        assert!(!bus.is_started());
        assert_eq!(adapter.take(), vec!["start", "stop"]);
        assert_eq!(watcher.journal.take(), vec!["online false"]);

        // Restart after stop
        bus.on_owner_start();
        assert_eq!(adapter.take(), vec!["start"]);
    }

    #[test]
    fn test_wiring_a_started_owner_starts_the_adapter() {
        let (bus, watcher) = bus_with_watcher("life-late-wire");
        bus.on_owner_start();

        let adapter = Journal::new();
        bus.wire(LinkAdapter {
            journal: adapter.clone(),
        });
        assert_eq!(adapter.take(), vec!["start"]);
        assert_eq!(watcher.journal.take(), vec!["online true"]);
    }

    #[test]
    fn test_failing_adapter_does_not_block_the_others() {
        let (bus, watcher) = bus_with_watcher("life-broken");
        let broken = Journal::new();
        let link = Journal::new();
        bus.wire(BrokenAdapter {
            journal: broken.clone(),
        });
        bus.wire(LinkAdapter {
            journal: link.clone(),
        });

        bus.on_owner_start();
        assert_eq!(broken.take(), vec!["start attempt"]);
        assert_eq!(link.take(), vec!["start"]);
        assert_eq!(watcher.journal.take(), vec!["online true"]);

        bus.on_owner_stop();
        assert_eq!(broken.take(), vec!["stop"]);
        assert_eq!(link.take(), vec!["stop"]);
    }

    #[test]
    fn test_destroy_stops_adapters_and_detaches() {
        let (bus, watcher) = bus_with_watcher("life-destroy");
        let adapter = Journal::new();
        bus.wire(LinkAdapter {
            journal: adapter.clone(),
        });
        bus.on_owner_start();

        bus.on_owner_destroy();
        assert_eq!(adapter.take(), vec!["start", "stop"]);
        assert_eq!(watcher.journal.take(), vec!["online true", "online false"]);
        assert!(!bus.is_started());
        assert!(bus.context().is_none());

        // Destroying a stopped owner does not stop adapters twice
        bus.on_owner_destroy();
        assert!(adapter.is_empty());
    }

    #[test]
    fn test_attach_and_detach_keep_registrations() {
        let (bus, watcher) = bus_with_watcher("life-attach");
        assert_eq!(bus.context().map(|c| c.name().to_string()).as_deref(), Some("life-attach"));

        let previous = bus.detach_context().unwrap();
        assert!(bus.detach_context().is_none());
        bus.post(Connectivity { online: true }).unwrap();

        bus.attach_context(isolated_context("life-attach-next"));
        bus.post(Connectivity { online: false }).unwrap();
        assert_eq!(watcher.journal.take(), vec!["online true", "online false"]);
        assert_eq!(bus.context().unwrap().name(), "life-attach-next");
        assert!(bus.has_registered(&watcher).unwrap());
        drop(previous);
    }

    /// Polls a simulated link from its own thread while started, posting
    /// every reading into the bus.
    struct PollingAdapter {
        readings: Vec<bool>,
        running: Arc<AtomicBool>,
        poller: Option<JoinHandle<()>>,
    }

    impl Wireable for PollingAdapter {
        fn on_start(&mut self, bus: &Bus) -> anyhow::Result<()> {
            self.running.store(true, Ordering::SeqCst);
            let bus = bus.clone();
            let running = self.running.clone();
            let readings = self.readings.clone();
            self.poller = Some(std::thread::spawn(move || {
                for online in readings {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    if bus.post(Connectivity { online }).is_err() {
                        break;
                    }
                }
            }));
            Ok(())
        }

        fn on_stop(&mut self, _bus: &Bus) -> anyhow::Result<()> {
            self.running.store(false, Ordering::SeqCst);
            if let Some(poller) = self.poller.take() {
                poller
                    .join()
                    .map_err(|_| anyhow::anyhow!("poller panicked"))?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_adapter_threads_post_through_the_run_loop() {
        let (bus, watcher) = bus_with_watcher("life-polling");
        bus.wire(PollingAdapter {
            readings: vec![true, false, true],
            running: Arc::new(AtomicBool::new(false)),
            poller: None,
        });

        bus.on_owner_start();
        assert!(settle(WAIT, || watcher.journal.len() == 3).await);
        assert_eq!(
            watcher.journal.take(),
            vec!["online true", "online false", "online true"]
        );

        bus.on_owner_stop();
        assert_eq!(bus.stats().posted, 3);
    }
}
