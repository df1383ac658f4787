use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{RoomContext, RoomResult};
use crate::store::{Filter, Query};
use crate::sync::SyncedCollection;
use crate::types::{RoomId, TimerState};

/// Preset buttons, in minutes
pub const PRESET_MINUTES: [u64; 3] = [3, 6, 10];

const MINUTE_DIGITS: usize = 3;
const SECOND_DIGITS: usize = 2;

/// Local audible alert when the countdown reaches zero. Implementations
/// ignore their own playback failures.
pub trait Chime: Send + Sync {
    fn ring(&self);
}

pub struct SilentChime;

impl Chime for SilentChime {
    fn ring(&self) {}
}

/// `MM:SS`, rounding partial seconds up
pub fn format_remaining(ms: i64) -> String {
    let total = ms.max(0).saturating_add(999) / 1000;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Manual minute/second fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerInputs {
    minutes: String,
    seconds: String,
}

impl Default for TimerInputs {
    fn default() -> Self {
        Self {
            minutes: "3".to_string(),
            seconds: "00".to_string(),
        }
    }
}

fn digits(raw: &str, max: usize) -> String {
    raw.chars().filter(char::is_ascii_digit).take(max).collect()
}

impl TimerInputs {
    pub fn minutes(&self) -> &str {
        &self.minutes
    }

    pub fn seconds(&self) -> &str {
        &self.seconds
    }

    pub fn set_minutes(&mut self, raw: &str) {
        self.minutes = digits(raw, MINUTE_DIGITS);
    }

    pub fn set_seconds(&mut self, raw: &str) {
        self.seconds = digits(raw, SECOND_DIGITS);
    }

    /// Combined duration; blank fields count as zero
    pub fn total_seconds(&self) -> u64 {
        let minutes: u64 = self.minutes.parse().unwrap_or(0);
        let seconds: u64 = self.seconds.parse().unwrap_or(0);
        minutes * 60 + seconds
    }

    /// Show `remaining_ms` in the fields, rounded to the nearest second
    pub fn sync_from(&mut self, remaining_ms: i64) {
        let total = remaining_ms.max(0).saturating_add(500) / 1000;
        self.minutes = (total / 60).to_string();
        self.seconds = format!("{:02}", total % 60);
    }
}

/// Detects the tick on which the display reaches zero
#[derive(Debug, Default)]
pub struct ZeroCrossing {
    previous: Option<i64>,
}

impl ZeroCrossing {
    /// True only when the previous observation was positive and this one is
    /// zero. The first observation never fires.
    pub fn observe(&mut self, remaining_ms: i64) -> bool {
        let crossed = matches!(self.previous, Some(previous) if previous > 0) && remaining_ms == 0;
        self.previous = Some(remaining_ms);
        crossed
    }
}

/// Shared countdown for one room
pub struct TimerPanel {
    room_id: RoomId,
    timers: SyncedCollection<TimerState>,
    inputs: Arc<Mutex<TimerInputs>>,
    remaining: watch::Receiver<i64>,
    tasks: Vec<JoinHandle<()>>,
}

fn lock_inputs(inputs: &Mutex<TimerInputs>) -> std::sync::MutexGuard<'_, TimerInputs> {
    match inputs.lock() {
        Ok(inputs) => inputs,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TimerPanel {
    pub async fn open(context: &RoomContext, chime: Arc<dyn Chime>) -> Self {
        let timers = SyncedCollection::<TimerState>::open(
            context.backend.clone(),
            Query::new(Filter::room(&context.room_id)),
            context.timings.poll,
        )
        .await;

        let inputs = Arc::new(Mutex::new(TimerInputs::default()));
        if let Some(state) = timers.rows().first() {
            lock_inputs(&inputs).sync_from(state.remaining_ms);
        }

        let now_left = timers
            .rows()
            .first()
            .map_or(0, |state| state.remaining_ms_at(Utc::now()));
        let (remaining_tx, remaining) = watch::channel(now_left);

        let mut tasks = Vec::new();

        // display clock and zero-crossing alert
        let clock = timers.handle();
        let period = context.timings.tick;
        tasks.push(tokio::spawn(async move {
            let mut crossing = ZeroCrossing::default();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let left = clock
                    .rows()
                    .first()
                    .map_or(0, |state| state.remaining_ms_at(Utc::now()));
                if crossing.observe(left) {
                    tracing::debug!("Timer reached zero");
                    chime.ring();
                }
                remaining_tx.send_if_modified(|shown| {
                    let changed = *shown != left;
                    *shown = left;
                    changed
                });
            }
        }));

        // re-sync the inputs whenever a different row arrives
        let mut rows = timers.watch();
        let synced = inputs.clone();
        tasks.push(tokio::spawn(async move {
            let mut last = rows.borrow_and_update().first().cloned();
            while rows.changed().await.is_ok() {
                let current = rows.borrow_and_update().first().cloned();
                if current != last {
                    if let Some(state) = &current {
                        lock_inputs(&synced).sync_from(state.remaining_ms);
                    }
                    last = current;
                }
            }
        }));

        Self {
            room_id: context.room_id.clone(),
            timers,
            inputs,
            remaining,
            tasks,
        }
    }

    pub fn state(&self) -> Option<TimerState> {
        self.timers.rows().into_iter().next()
    }

    /// Remaining time as every client computes it
    pub fn remaining_ms(&self) -> i64 {
        self.state()
            .map_or(0, |state| state.remaining_ms_at(Utc::now()))
    }

    pub fn display(&self) -> String {
        format_remaining(self.remaining_ms())
    }

    /// Remaining time, updated every tick
    pub fn watch_remaining(&self) -> watch::Receiver<i64> {
        self.remaining.clone()
    }

    pub fn inputs(&self) -> TimerInputs {
        lock_inputs(&self.inputs).clone()
    }

    pub fn set_minutes(&self, raw: &str) {
        lock_inputs(&self.inputs).set_minutes(raw);
    }

    pub fn set_seconds(&self, raw: &str) {
        lock_inputs(&self.inputs).set_seconds(raw);
    }

    /// Start counting down `total_seconds`; zero leaves the timer stopped at
    /// zero
    pub async fn start(&self, total_seconds: u64) -> RoomResult<()> {
        self.commit(TimerState::started(&self.room_id, total_seconds, Utc::now()))
            .await
    }

    pub async fn start_from_inputs(&self) -> RoomResult<()> {
        let total = self.inputs().total_seconds();
        self.start(total).await
    }

    pub async fn apply_preset(&self, minutes: u64) -> RoomResult<()> {
        {
            let mut inputs = lock_inputs(&self.inputs);
            inputs.set_minutes(&minutes.to_string());
            inputs.set_seconds("00");
        }
        self.start(minutes.saturating_mul(60)).await
    }

    /// Freeze whatever is left
    pub async fn pause(&self) -> RoomResult<()> {
        let current = self
            .state()
            .unwrap_or_else(|| TimerState::idle(&self.room_id));
        self.commit(current.paused(Utc::now())).await
    }

    async fn commit(&self, next: TimerState) -> RoomResult<()> {
        let row = serde_json::to_value(&next)
            .map_err(|e| crate::store::StoreError::Decode(e.to_string()))?;
        self.timers.upsert(row).await?;
        lock_inputs(&self.inputs).sync_from(next.remaining_ms);
        Ok(())
    }
}

impl Drop for TimerPanel {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::store::MemoryStore;
    use crate::sync::Backend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingChime(AtomicUsize);

    impl Chime for CountingChime {
        fn ring(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn context(store: &MemoryStore, tick_ms: u64) -> RoomContext {
        RoomContext {
            room_id: "room1".to_string(),
            username: "alice".to_string(),
            backend: Backend::Remote(Arc::new(store.clone())),
            timings: Timings {
                tick: Duration::from_millis(tick_ms),
                ..Timings::default()
            },
        }
    }

    #[test]
    fn test_format_rounds_seconds_up() {
        assert_eq!(format_remaining(0), "00:00");
        assert_eq!(format_remaining(1), "00:01");
        assert_eq!(format_remaining(59_001), "01:00");
        assert_eq!(format_remaining(180_000), "03:00");
        assert_eq!(format_remaining(-5), "00:00");
        assert_eq!(format_remaining(6_000_000), "100:00");
    }

    #[test]
    fn test_inputs_accept_digits_only() {
        let mut inputs = TimerInputs::default();
        assert_eq!(inputs.total_seconds(), 180);

        inputs.set_minutes("1a2-34");
        inputs.set_seconds("x75y");
        assert_eq!(inputs.minutes(), "123");
        assert_eq!(inputs.seconds(), "75");
        assert_eq!(inputs.total_seconds(), 123 * 60 + 75);

        inputs.set_minutes("");
        inputs.set_seconds("");
        assert_eq!(inputs.total_seconds(), 0);

        inputs.sync_from(65_400);
        assert_eq!((inputs.minutes(), inputs.seconds()), ("1", "05"));
    }

    #[test]
    fn test_extreme_remaining_values_do_not_overflow() {
        assert_eq!(format_remaining(i64::MIN), "00:00");
        let shown = format_remaining(i64::MAX);
        assert!(shown.ends_with(":55"), "{}", shown);

        let mut inputs = TimerInputs::default();
        inputs.sync_from(i64::MAX);
        assert_eq!(inputs.minutes(), (i64::MAX / 1000 / 60).to_string());
        assert_eq!(inputs.seconds(), "55");
    }

    #[test]
    fn test_zero_crossing_fires_once() {
        let mut crossing = ZeroCrossing::default();
        assert!(!crossing.observe(0));
        assert!(!crossing.observe(1_000));
        assert!(!crossing.observe(200));
        assert!(crossing.observe(0));
        assert!(!crossing.observe(0));
        assert!(!crossing.observe(0));
        assert!(!crossing.observe(5_000));
        assert!(crossing.observe(0));
    }

    #[tokio::test]
    async fn test_start_zero_and_start_then_pause() {
        let store = MemoryStore::new();
        let panel = TimerPanel::open(&context(&store, 200), Arc::new(SilentChime)).await;
        assert_eq!(panel.display(), "00:00");

        panel.start(0).await.unwrap();
        let state = panel.state().unwrap();
        assert!(!state.running);
        assert_eq!(panel.remaining_ms(), 0);

        panel.start(90).await.unwrap();
        assert!(panel.state().unwrap().running);
        panel.pause().await.unwrap();
        let paused = panel.state().unwrap();
        assert!(!paused.running);
        assert_eq!(paused.ends_at, None);
        assert!(paused.remaining_ms <= 90_000 && paused.remaining_ms > 85_000);
        assert_eq!(panel.inputs().minutes(), "1");
        assert_eq!(panel.inputs().seconds(), "30");
    }

    #[tokio::test]
    async fn test_preset_sets_inputs_and_starts() {
        let store = MemoryStore::new();
        let panel = TimerPanel::open(&context(&store, 200), Arc::new(SilentChime)).await;
        panel.apply_preset(6).await.unwrap();
        let state = panel.state().unwrap();
        assert!(state.running);
        assert_eq!(state.remaining_ms, 360_000);
        assert_eq!(state.label, "Timer");
        assert_eq!(panel.inputs().minutes(), "6");
        assert_eq!(panel.inputs().seconds(), "00");
    }

    #[tokio::test]
    async fn test_start_from_typed_inputs() {
        let store = MemoryStore::new();
        let panel = TimerPanel::open(&context(&store, 200), Arc::new(SilentChime)).await;

        panel.set_minutes("2");
        panel.set_seconds("5s");
        panel.start_from_inputs().await.unwrap();
        let state = panel.state().unwrap();
        assert!(state.running);
        assert_eq!(state.remaining_ms, 125_000);
        assert_eq!((panel.inputs().minutes(), panel.inputs().seconds()), ("2", "05"));

        // blank fields start nothing
        panel.set_minutes("");
        panel.set_seconds("");
        panel.start_from_inputs().await.unwrap();
        let state = panel.state().unwrap();
        assert!(!state.running);
        assert_eq!(panel.remaining_ms(), 0);
    }

    #[tokio::test]
    async fn test_chime_rings_once_when_countdown_ends() {
        let store = MemoryStore::new();
        let chime = Arc::new(CountingChime::default());
        let panel = TimerPanel::open(&context(&store, 20), chime.clone()).await;

        panel.start(1).await.unwrap();
        let mut remaining = panel.watch_remaining();
        tokio::time::timeout(Duration::from_secs(3), async {
            remaining.wait_for(|ms| *ms > 0).await.unwrap();
            remaining.wait_for(|ms| *ms == 0).await.unwrap();
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(chime.0.load(Ordering::SeqCst), 1);
    }
}
