//! Pushes the stored credential record into an embedded surface.
//!
//! The surface's script may not be listening when the frame reports loaded, so
//! `SYNC_CREDENTIALS` is broadcast once immediately and then again after each
//! delay of a fixed schedule. Delivery is only acknowledged at the application
//! level (the surface announcing `READY`), never by the channel itself.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};

use crate::clock::Clock;
use crate::envelope::{Envelope, MessageType};
use crate::error::DialogError;
use crate::session::CredentialRecord;
use crate::transport::MessageTarget;

/// Default retry delays after the first push, in milliseconds.
pub const DEFAULT_SYNC_SCHEDULE_MS: [u64; 5] = [200, 400, 800, 1500, 3000];

/// A finite list of retry delays.
///
/// Implements [`BackoffBuilder`] so the schedule is consumed as a plain
/// iterator; nothing here owns a timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSchedule {
    delays: Vec<Duration>,
}

impl SyncSchedule {
    /// Builds a schedule from millisecond delays.
    #[must_use]
    pub fn from_millis(delays: &[u64]) -> Self {
        Self {
            delays: delays.iter().copied().map(Duration::from_millis).collect(),
        }
    }

    /// Number of retries after the first push.
    #[must_use]
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    /// Whether only the immediate push happens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

impl Default for SyncSchedule {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_SYNC_SCHEDULE_MS)
    }
}

impl BackoffBuilder for SyncSchedule {
    type Backoff = std::vec::IntoIter<Duration>;

    fn build(self) -> Self::Backoff {
        self.delays.into_iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AckState {
    #[default]
    Waiting,
    Armed,
    Acknowledged,
}

/// Application-level acknowledgement of a push.
///
/// Only counts once the first push went out; an acknowledgement observed
/// before that is ignored.
#[derive(Debug, Clone, Default)]
pub struct SyncAck(Rc<Cell<AckState>>);

impl SyncAck {
    /// Records an acknowledgement from the surface.
    pub fn acknowledge(&self) {
        if self.0.get() == AckState::Armed {
            self.0.set(AckState::Acknowledged);
        }
    }

    /// Whether the surface acknowledged a push.
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        self.0.get() == AckState::Acknowledged
    }

    fn arm(&self) {
        if self.0.get() == AckState::Waiting {
            self.0.set(AckState::Armed);
        }
    }
}

/// Why a synchronization run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncOutcome {
    /// The surface acknowledged.
    Acknowledged,
    /// Every scheduled push went out unacknowledged.
    #[default]
    Exhausted,
    /// No surface opened within the deferral budget.
    NoSurface,
    /// The surface went away between pushes.
    SurfaceClosed,
}

/// What a synchronization run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    /// Pushes posted (including failed posts).
    pub attempts: usize,
    /// Times the push was re-armed waiting for a surface.
    pub deferrals: usize,
    /// Why the run ended.
    pub outcome: SyncOutcome,
}

/// Broadcasts the credential record into the embedded surface on a schedule.
pub struct CredentialSynchronizer {
    schedule: SyncSchedule,
    defer_delay: Duration,
    max_deferrals: usize,
    clock: Rc<dyn Clock>,
}

impl CredentialSynchronizer {
    /// Creates a synchronizer. While no surface is open, the push is re-armed
    /// every `defer_delay`, at most `max_deferrals` times.
    pub fn new(
        schedule: SyncSchedule,
        defer_delay: Duration,
        max_deferrals: usize,
        clock: Rc<dyn Clock>,
    ) -> Self {
        Self {
            schedule,
            defer_delay,
            max_deferrals,
            clock,
        }
    }

    /// Pushes `record` into whatever `surface` returns until `ack` is set or the
    /// schedule runs out.
    ///
    /// `surface` is probed before every push; `None` means no embedded surface
    /// is open.
    pub async fn run(
        &self,
        record: &CredentialRecord,
        surface: &dyn Fn() -> Option<Rc<dyn MessageTarget>>,
        ack: &SyncAck,
    ) -> SyncReport {
        let mut report = SyncReport::default();

        let mut deferrals = ConstantBuilder::default()
            .with_delay(self.defer_delay)
            .with_max_times(self.max_deferrals)
            .build();
        let mut target = loop {
            if let Some(target) = surface() {
                break target;
            }
            let Some(delay) = deferrals.next() else {
                log::warn!("no embedded surface opened, credential sync abandoned");
                report.outcome = SyncOutcome::NoSurface;
                return report;
            };
            report.deferrals += 1;
            self.clock.sleep(delay).await;
        };

        let mut delays = self.schedule.clone().build();
        loop {
            report.attempts += 1;
            if let Err(err) = self.push(target.as_ref(), record) {
                log::debug!("credential sync attempt {} failed: {err}", report.attempts);
            }
            ack.arm();

            let Some(delay) = delays.next() else {
                report.outcome = SyncOutcome::Exhausted;
                break;
            };
            self.clock.sleep(delay).await;

            if ack.is_acknowledged() {
                report.outcome = SyncOutcome::Acknowledged;
                break;
            }
            match surface() {
                Some(current) => target = current,
                None => {
                    report.outcome = SyncOutcome::SurfaceClosed;
                    break;
                }
            }
        }

        log::debug!(
            "credential sync finished: {:?} after {} attempt(s)",
            report.outcome,
            report.attempts
        );
        report
    }

    fn push(&self, target: &dyn MessageTarget, record: &CredentialRecord) -> Result<(), DialogError> {
        let envelope = Envelope::host(MessageType::SyncCredentials, self.clock.now_ms())
            .with_data(serde_json::to_value(record)?);
        target.post(&envelope.to_value()?)
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::clock::TokioClock;
    use crate::memory::RecordingTarget;

    fn record() -> CredentialRecord {
        CredentialRecord {
            credential_id: "abc".to_string(),
            public_key: vec![1, 2, 3],
            derived_address: None,
            updated_at: 1,
        }
    }

    fn synchronizer() -> CredentialSynchronizer {
        CredentialSynchronizer::new(
            SyncSchedule::default(),
            Duration::from_millis(250),
            40,
            Rc::new(TokioClock::new()),
        )
    }

    #[test]
    fn test_schedule_is_consumed_as_an_iterator() {
        let delays: Vec<_> = SyncSchedule::default().build().collect();
        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0], Duration::from_millis(200));
        assert_eq!(delays[4], Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_sync_pushes_len_plus_one_times() {
        let target = Rc::new(RecordingTarget::new());
        let probe = {
            let target = Rc::clone(&target);
            move || Some(Rc::clone(&target) as Rc<dyn MessageTarget>)
        };

        let started = tokio::time::Instant::now();
        let report = synchronizer().run(&record(), &probe, &SyncAck::default()).await;

        assert_eq!(report.attempts, 6);
        assert_eq!(report.outcome, SyncOutcome::Exhausted);
        assert_eq!(target.posted().len(), 6);
        assert!(target
            .envelopes()
            .iter()
            .all(|e| e.kind == MessageType::SyncCredentials && e.request_id.is_none()));
        // no trailing sleep after the final push
        assert!(started.elapsed() < Duration::from_millis(5_950));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledgement_stops_retries() {
        let target = Rc::new(RecordingTarget::new());
        let ack = SyncAck::default();
        let probe = {
            let target = Rc::clone(&target);
            move || Some(Rc::clone(&target) as Rc<dyn MessageTarget>)
        };

        let synchronizer = synchronizer();
        let record = record();
        let run = synchronizer.run(&record, &probe, &ack);
        let acknowledge = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            ack.acknowledge();
        };
        let (report, ()) = tokio::join!(run, acknowledge);

        // pushes at 0 and 200 ms; the ack at 500 ms is seen after the 400 ms wait
        assert_eq!(report.outcome, SyncOutcome::Acknowledged);
        assert_eq!(report.attempts, 2);
    }

    #[test]
    fn test_acknowledgement_before_first_push_is_ignored() {
        let ack = SyncAck::default();
        ack.acknowledge();
        assert!(!ack.is_acknowledged());
        ack.arm();
        ack.acknowledge();
        assert!(ack.is_acknowledged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_is_deferred_until_a_surface_opens() {
        let target = Rc::new(RecordingTarget::new());
        let slot: RefCell<Option<Rc<dyn MessageTarget>>> = RefCell::new(None);
        let probe = || slot.borrow().clone();

        let (synchronizer, record, ack) = (synchronizer(), record(), SyncAck::default());
        let run = synchronizer.run(&record, &probe, &ack);
        let open = async {
            tokio::time::sleep(Duration::from_millis(600)).await;
            *slot.borrow_mut() = Some(Rc::clone(&target) as Rc<dyn MessageTarget>);
        };
        let (report, ()) = tokio::join!(run, open);

        assert_eq!(report.deferrals, 3);
        assert_eq!(report.attempts, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferral_is_bounded() {
        let probe = || -> Option<Rc<dyn MessageTarget>> { None };
        let report = synchronizer().run(&record(), &probe, &SyncAck::default()).await;
        assert_eq!(report.outcome, SyncOutcome::NoSurface);
        assert_eq!(report.deferrals, 40);
        assert_eq!(report.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_surface_ends_the_run() {
        let target = Rc::new(RecordingTarget::new());
        let slot: RefCell<Option<Rc<dyn MessageTarget>>> =
            RefCell::new(Some(Rc::clone(&target) as Rc<dyn MessageTarget>));
        let probe = || slot.borrow().clone();

        let (synchronizer, record, ack) = (synchronizer(), record(), SyncAck::default());
        let run = synchronizer.run(&record, &probe, &ack);
        let close = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            slot.borrow_mut().take();
        };
        let (report, ()) = tokio::join!(run, close);
        assert_eq!(report.outcome, SyncOutcome::SurfaceClosed);
        assert_eq!(report.attempts, 2);
    }
}
