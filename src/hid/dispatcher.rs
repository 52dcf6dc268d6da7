//! Event dispatch loop
//!
//! One task reads the source, translates remote values and drives the
//! backend. Every suspension point (next event, settle delay, reconnect
//! poll) also watches the cancellation token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backend::HidBackend;
use super::keymap::{EventFilter, TranslationTable};
use super::source::EventSource;
use super::types::{OutputMode, RawEvent};
use crate::config::DispatcherConfig;
use crate::error::{AppError, Result};
use crate::utils::Scheduler;

/// Single global debounce window
///
/// Any accepted event, whatever its button, opens the window; events
/// suppressed inside it do not extend it.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    last_accepted: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: None,
        }
    }

    /// Accept an event at `now`, or reject it inside the window
    pub fn accept(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.window {
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }
}

/// Counters for one dispatch session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub filtered: u64,
    pub unmapped: u64,
    pub debounced: u64,
    pub dispatched: u64,
    pub lost: u64,
    pub reconnects: u64,
}

enum Flow {
    Continue,
    Stop,
}

/// Dispatch session: source, table, backend and timing
pub struct Dispatcher<S, B> {
    source: S,
    backend: B,
    table: TranslationTable,
    filter: EventFilter,
    scheduler: Arc<dyn Scheduler>,
    config: DispatcherConfig,
    debouncer: Debouncer,
    stats: DispatchStats,
}

impl<S: EventSource, B: HidBackend> Dispatcher<S, B> {
    pub fn new(
        source: S,
        backend: B,
        table: TranslationTable,
        filter: EventFilter,
        scheduler: Arc<dyn Scheduler>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        if table.mode() != backend.mode() {
            return Err(AppError::Config(format!(
                "translation table is for {} output but backend {} is {}",
                table.mode().as_str(),
                backend.name(),
                backend.mode().as_str()
            )));
        }

        Ok(Self {
            source,
            backend,
            table,
            filter,
            scheduler,
            debouncer: Debouncer::new(config.debounce()),
            config,
            stats: DispatchStats::default(),
        })
    }

    /// Run until cancelled; the backend is shut down on every exit path
    pub async fn run(mut self, cancel: CancellationToken) -> Result<DispatchStats> {
        info!(
            source = %self.source.describe(),
            backend = self.backend.name(),
            mappings = self.table.len(),
            "Dispatcher started"
        );

        self.event_loop(&cancel).await;

        if let Err(e) = self.backend.shutdown().await {
            warn!(backend = self.backend.name(), "Failed to close backend: {}", e);
        }
        info!(stats = ?self.stats, "Dispatcher stopped");
        Ok(self.stats)
    }

    async fn event_loop(&mut self, cancel: &CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Dispatcher cancelled while waiting for input");
                    return;
                }
                next = self.source.next_event() => next,
            };

            let flow = match next {
                Ok(event) => self.handle_event(event, cancel).await,
                Err(e) => {
                    warn!(
                        source = %self.source.describe(),
                        "Input device read failed: {}",
                        e
                    );
                    self.reconnect(cancel).await
                }
            };

            if let Flow::Stop = flow {
                return;
            }
        }
    }

    async fn handle_event(&mut self, event: RawEvent, cancel: &CancellationToken) -> Flow {
        self.stats.received += 1;

        if !self.filter.matches(&event) {
            self.stats.filtered += 1;
            trace!(?event, "Ignoring event");
            return Flow::Continue;
        }

        info!(
            event_type = event.event_type,
            event_code = event.code,
            event_value = event.value,
            "Received event"
        );

        let Some(code) = self.table.translate(event.value) else {
            self.stats.unmapped += 1;
            let err = AppError::UnmappedEvent(event.value);
            warn!(code = err.code(), event_value = event.value, "{}", err);
            return Flow::Continue;
        };

        if !self.debouncer.accept(self.scheduler.now()) {
            self.stats.debounced += 1;
            info!(
                output = code,
                window_ms = self.config.debounce_ms,
                "Event within debounce window, skipping"
            );
            return Flow::Continue;
        }

        self.dispatch(code, event.value, cancel).await
    }

    async fn dispatch(&mut self, code: u16, value: i32, cancel: &CancellationToken) -> Flow {
        let label = self.table.description(value).unwrap_or_default().to_string();

        if let Err(e) = self.backend.press(code).await {
            self.stats.lost += 1;
            warn!(
                output = code,
                remote_value = value,
                code = e.code(),
                "Button press lost: {}",
                e
            );
            return Flow::Continue;
        }
        info!(output = code, remote_value = value, label = %label, "Button pressed");

        let mut flow = Flow::Continue;
        if self.backend.mode() == OutputMode::Gadget {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Cancelled during settle delay, releasing before exit");
                    flow = Flow::Stop;
                }
                _ = self.scheduler.sleep(self.config.settle()) => {}
            }
        }

        match self.backend.release(code).await {
            Ok(()) => {
                self.stats.dispatched += 1;
                info!(output = code, "Button released");
            }
            Err(e) => {
                self.stats.lost += 1;
                warn!(output = code, code = e.code(), "Button release lost: {}", e);
            }
        }
        flow
    }

    /// Poll the source until it comes back; `Stop` if cancelled meanwhile
    async fn reconnect(&mut self, cancel: &CancellationToken) -> Flow {
        let interval = self.config.reconnect_interval();
        info!(
            source = %self.source.describe(),
            interval_ms = self.config.reconnect_interval_ms,
            "Waiting for input device"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Dispatcher cancelled while reconnecting");
                    return Flow::Stop;
                }
                _ = self.scheduler.sleep(interval) => {}
            }

            match self.source.reconnect().await {
                Ok(()) => {
                    self.stats.reconnects += 1;
                    info!(source = %self.source.describe(), "Input device reconnected");
                    return Flow::Continue;
                }
                Err(e) => {
                    debug!(source = %self.source.describe(), "Input device still unavailable: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventSelector, Mapping, MappingDefinition};
    use crate::hid::types::ReportLayout;
    use crate::otg::report_desc::gamepad_descriptor;
    use crate::utils::scheduler::ManualScheduler;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;

    const SCAN: u16 = 4;

    #[derive(Debug)]
    enum Step {
        Event(i32),
        Raw(RawEvent),
        Wait(Duration),
        Fail,
    }

    /// Plays back a script, then cancels the session
    struct ScriptedSource {
        steps: VecDeque<Step>,
        clock: Arc<ManualScheduler>,
        cancel: CancellationToken,
        reconnect_failures: usize,
        reconnect_attempts: Arc<Mutex<usize>>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>, clock: Arc<ManualScheduler>, cancel: CancellationToken) -> Self {
            Self {
                steps: steps.into(),
                clock,
                cancel,
                reconnect_failures: 0,
                reconnect_attempts: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn next_event(&mut self) -> io::Result<RawEvent> {
            loop {
                match self.steps.pop_front() {
                    Some(Step::Event(value)) => return Ok(RawEvent::new(4, SCAN, value)),
                    Some(Step::Raw(event)) => return Ok(event),
                    Some(Step::Wait(d)) => self.clock.advance(d),
                    Some(Step::Fail) => {
                        return Err(io::Error::from_raw_os_error(libc::ENODEV))
                    }
                    None => {
                        self.cancel.cancel();
                        std::future::pending::<()>().await;
                    }
                }
            }
        }

        async fn reconnect(&mut self) -> io::Result<()> {
            *self.reconnect_attempts.lock() += 1;
            if self.reconnect_failures > 0 {
                self.reconnect_failures -= 1;
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            Ok(())
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Action {
        Frame(Vec<u8>),
        Press(u16),
        Release(u16),
        Shutdown,
    }

    /// Records what would be written; gadget mode encodes real frames
    struct RecordingBackend {
        mode: OutputMode,
        layout: ReportLayout,
        log: Arc<Mutex<Vec<(Duration, Action)>>>,
        clock: Arc<ManualScheduler>,
        fail_presses: Mutex<usize>,
    }

    impl RecordingBackend {
        fn new(mode: OutputMode, clock: Arc<ManualScheduler>) -> Self {
            Self {
                mode,
                layout: ReportLayout::from_geometry(&gamepad_descriptor(24).unwrap().geometry),
                log: Arc::new(Mutex::new(Vec::new())),
                clock,
                fail_presses: Mutex::new(0),
            }
        }

        fn record(&self, action: Action) {
            self.log.lock().push((self.clock.elapsed(), action));
        }
    }

    #[async_trait]
    impl HidBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn mode(&self) -> OutputMode {
            self.mode
        }

        async fn press(&self, code: u16) -> Result<()> {
            {
                let mut failures = self.fail_presses.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(AppError::NotFound {
                        path: "/dev/hidg0".to_string(),
                    });
                }
            }
            match self.mode {
                OutputMode::Gadget => self.record(Action::Frame(self.layout.pressed(code)?)),
                OutputMode::Virtual => self.record(Action::Press(code)),
            }
            Ok(())
        }

        async fn release(&self, code: u16) -> Result<()> {
            match self.mode {
                OutputMode::Gadget => self.record(Action::Frame(self.layout.released())),
                OutputMode::Virtual => self.record(Action::Release(code)),
            }
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.record(Action::Shutdown);
            Ok(())
        }
    }

    fn mapping() -> MappingDefinition {
        let entry = |value: i32, button: u16, key: &str| Mapping {
            event_code: Some(key.to_string()),
            button: Some(button),
            remote_value: value,
            description: format!("button {}", button),
        };
        MappingDefinition {
            name: "test remote".to_string(),
            description: String::new(),
            event: EventSelector {
                event_type: "EV_MSC".to_string(),
                code: Some("MSC_SCAN".to_string()),
            },
            mappings: vec![
                entry(100, 5, "BTN_SOUTH"),
                entry(200, 0, "BTN_EAST"),
                entry(300, 23, "KEY_UP"),
            ],
        }
    }

    struct Harness {
        clock: Arc<ManualScheduler>,
        log: Arc<Mutex<Vec<(Duration, Action)>>>,
        reconnect_attempts: Arc<Mutex<usize>>,
        stats: DispatchStats,
    }

    impl Harness {
        fn actions(&self) -> Vec<Action> {
            self.log.lock().iter().map(|(_, a)| a.clone()).collect()
        }
    }

    async fn run_session(
        mode: OutputMode,
        steps: Vec<Step>,
        tweak: impl FnOnce(&mut ScriptedSource, &RecordingBackend),
    ) -> Harness {
        let clock = Arc::new(ManualScheduler::new());
        let cancel = CancellationToken::new();
        let mut source = ScriptedSource::new(steps, clock.clone(), cancel.clone());
        let backend = RecordingBackend::new(mode, clock.clone());
        tweak(&mut source, &backend);

        let log = backend.log.clone();
        let reconnect_attempts = source.reconnect_attempts.clone();
        let def = mapping();
        let table = match mode {
            OutputMode::Gadget => TranslationTable::gadget_buttons(&def, 24).unwrap(),
            OutputMode::Virtual => TranslationTable::virtual_keys(&def).unwrap(),
        };
        let filter = EventFilter::from_selector(&def.event).unwrap();

        let dispatcher = Dispatcher::new(
            source,
            backend,
            table,
            filter,
            clock.clone(),
            DispatcherConfig::default(),
        )
        .unwrap();
        let stats = dispatcher.run(cancel).await.unwrap();

        Harness {
            clock,
            log,
            reconnect_attempts,
            stats,
        }
    }

    #[test]
    fn test_debouncer_window() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(200));
        assert!(debouncer.accept(start));
        assert!(!debouncer.accept(start + Duration::from_millis(199)));
        // Suppressed events do not extend the window
        assert!(debouncer.accept(start + Duration::from_millis(200)));
        assert!(!debouncer.accept(start + Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn test_gadget_reference_frames() {
        let h = run_session(OutputMode::Gadget, vec![Step::Event(100)], |_, _| {}).await;

        assert_eq!(
            h.actions(),
            vec![
                Action::Frame(vec![0x01, 0x20, 0x00, 0x00]),
                Action::Frame(vec![0x01, 0x00, 0x00, 0x00]),
                Action::Shutdown,
            ]
        );
        let log = h.log.lock().clone();
        assert_eq!(log[1].0 - log[0].0, Duration::from_millis(200));
        assert_eq!(h.clock.sleeps(), vec![Duration::from_millis(200)]);
        assert_eq!(h.stats.dispatched, 1);
    }

    #[tokio::test]
    async fn test_virtual_press_release_without_delay() {
        let h = run_session(OutputMode::Virtual, vec![Step::Event(300)], |_, _| {}).await;

        assert_eq!(
            h.actions(),
            vec![Action::Press(103), Action::Release(103), Action::Shutdown]
        );
        assert!(h.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_debounce_is_global() {
        // Virtual mode has no settle delay, so only the script moves time
        let h = run_session(
            OutputMode::Virtual,
            vec![
                Step::Event(100),
                Step::Wait(Duration::from_millis(150)),
                Step::Event(200),
                Step::Wait(Duration::from_millis(60)),
                Step::Event(200),
            ],
            |_, _| {},
        )
        .await;

        assert_eq!(
            h.actions(),
            vec![
                Action::Press(0x130),
                Action::Release(0x130),
                Action::Press(0x131),
                Action::Release(0x131),
                Action::Shutdown,
            ]
        );
        assert_eq!(h.stats.debounced, 1);
        assert_eq!(h.stats.dispatched, 2);
    }

    #[tokio::test]
    async fn test_debounce_threshold() {
        let within = run_session(
            OutputMode::Virtual,
            vec![
                Step::Event(100),
                Step::Wait(Duration::from_millis(199)),
                Step::Event(100),
            ],
            |_, _| {},
        )
        .await;
        assert_eq!(within.stats.dispatched, 1);

        let apart = run_session(
            OutputMode::Virtual,
            vec![
                Step::Event(100),
                Step::Wait(Duration::from_millis(200)),
                Step::Event(100),
            ],
            |_, _| {},
        )
        .await;
        assert_eq!(apart.stats.dispatched, 2);
    }

    #[tokio::test]
    async fn test_unmapped_and_filtered_events_are_skipped() {
        let h = run_session(
            OutputMode::Gadget,
            vec![
                Step::Raw(RawEvent::new(0, 0, 0)),
                Step::Raw(RawEvent::new(4, 5, 100)),
                Step::Event(999),
                Step::Event(200),
            ],
            |_, _| {},
        )
        .await;

        assert_eq!(h.stats.received, 4);
        assert_eq!(h.stats.filtered, 2);
        assert_eq!(h.stats.unmapped, 1);
        assert_eq!(
            h.actions()[0],
            Action::Frame(vec![0x01, 0x01, 0x00, 0x00])
        );
    }

    #[tokio::test]
    async fn test_lost_press_skips_release() {
        let h = run_session(
            OutputMode::Gadget,
            vec![
                Step::Event(100),
                Step::Wait(Duration::from_millis(500)),
                Step::Event(300),
            ],
            |_, backend| *backend.fail_presses.lock() = 1,
        )
        .await;

        assert_eq!(h.stats.lost, 1);
        assert_eq!(
            h.actions(),
            vec![
                Action::Frame(vec![0x01, 0x00, 0x00, 0x80]),
                Action::Frame(vec![0x01, 0x00, 0x00, 0x00]),
                Action::Shutdown,
            ]
        );
    }

    #[tokio::test]
    async fn test_reconnect_resumes_reading() {
        let h = run_session(
            OutputMode::Gadget,
            vec![Step::Event(100), Step::Fail, Step::Event(200)],
            |source, _| source.reconnect_failures = 2,
        )
        .await;

        assert_eq!(*h.reconnect_attempts.lock(), 3);
        assert_eq!(h.stats.reconnects, 1);
        assert_eq!(h.stats.dispatched, 2);
        assert_eq!(
            h.clock.sleeps(),
            vec![
                Duration::from_millis(200),
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_millis(200),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_during_settle_still_releases() {
        let clock = Arc::new(ManualScheduler::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let backend = RecordingBackend::new(OutputMode::Gadget, clock.clone());
        let log = backend.log.clone();
        let def = mapping();
        let mut dispatcher = Dispatcher::new(
            ScriptedSource::new(vec![], clock.clone(), cancel.clone()),
            backend,
            TranslationTable::gadget_buttons(&def, 24).unwrap(),
            EventFilter::from_selector(&def.event).unwrap(),
            clock.clone(),
            DispatcherConfig::default(),
        )
        .unwrap();

        let flow = dispatcher.dispatch(5, 100, &cancel).await;
        assert!(matches!(flow, Flow::Stop));
        assert!(clock.sleeps().is_empty());

        let actions: Vec<Action> = log.lock().iter().map(|(_, a)| a.clone()).collect();
        assert_eq!(
            actions,
            vec![
                Action::Frame(vec![0x01, 0x20, 0x00, 0x00]),
                Action::Frame(vec![0x01, 0x00, 0x00, 0x00]),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_closes_backend() {
        let h = run_session(OutputMode::Virtual, vec![], |_, _| {}).await;
        assert_eq!(h.actions(), vec![Action::Shutdown]);
        assert_eq!(h.stats, DispatchStats::default());
    }

    #[tokio::test]
    async fn test_mode_mismatch_rejected() {
        let clock = Arc::new(ManualScheduler::new());
        let def = mapping();
        let result = Dispatcher::new(
            ScriptedSource::new(vec![], clock.clone(), CancellationToken::new()),
            RecordingBackend::new(OutputMode::Gadget, clock.clone()),
            TranslationTable::virtual_keys(&def).unwrap(),
            EventFilter::from_selector(&def.event).unwrap(),
            clock,
            DispatcherConfig::default(),
        );
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
