//! Statistics about building generating extensions, enabled by `YKD_LOG_STATS=<path|->`.
//! Durations are wall-clock time and are best effort only.

#[cfg(not(test))]
use std::env;
use std::{
    cell::Cell,
    fs,
    sync::Mutex,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// The counters that [Stats] keeps. Each variant's `to_string` is its JSON key.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
pub(crate) enum Counter {
    #[strum(to_string = "specializers_created")]
    SpecializersCreated,
    /// Bodies emitted with every argument static.
    #[strum(to_string = "bodies_specialized")]
    BodiesSpecialized,
    /// Bodies emitted with a run-time constness check and a generic fallback.
    #[strum(to_string = "bodies_unspecialized")]
    BodiesUnspecialized,
    /// Specializers which could not handle their instruction.
    #[strum(to_string = "bodies_unsupported")]
    BodiesUnsupported,
    #[strum(to_string = "register_syncers")]
    RegisterSyncers,
}

/// The different timing states a thread can go through. Variants must not be given explicit
/// discriminants: they index [StatsInner::durations]. A variant whose `to_string` is empty is not
/// reported.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
pub(crate) enum TimingState {
    #[strum(to_string = "")]
    None,
    /// Building a generating extension.
    #[strum(to_string = "duration_generating")]
    Generating,
}

thread_local! {
    static STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}

pub(crate) struct Stats {
    /// `None` if statistics are not being recorded, so that the common case takes no lock.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// Where to write output. `-` means stderr.
    output_path: String,
    counters: [u64; Counter::COUNT],
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    #[cfg(not(test))]
    pub fn new() -> Self {
        Self {
            inner: env::var("YKD_LOG_STATS")
                .ok()
                .map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    /// Tests always record statistics, writing them to stderr.
    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_owned()))),
        }
    }

    fn update_with<F: FnOnce(&mut StatsInner)>(&self, f: F) {
        if let Some(mtx) = &self.inner {
            // A poisoned lock still holds usable counters.
            let mut lk = mtx.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut lk);
        }
    }

    /// Add `n` to `counter`.
    pub fn count(&self, counter: Counter, n: u64) {
        self.update_with(|inner| inner.counters[counter as usize] += n);
    }

    /// Move the current thread into `new_state`, charging the time since the last change to the
    /// previous state.
    pub fn timing_state(&self, new_state: TimingState) {
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = STATE.replace((new_state, now));
            let d = &mut inner.durations[prev_state as usize];
            *d = d.saturating_add(now.saturating_duration_since(then));
        });
    }

    pub(crate) fn output(&self) {
        self.update_with(|inner| {
            let json = inner.to_json();
            if inner.output_path == "-" {
                eprintln!("{json}");
            } else {
                fs::write(&inner.output_path, json).ok();
            }
        });
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            counters: [0; Counter::COUNT],
            durations: [Duration::ZERO; TimingState::COUNT],
        }
    }

    /// Render as a JSON object with keys in sorted order.
    fn to_json(&self) -> String {
        let mut fields = Counter::iter()
            .map(|c| (c.to_string(), self.counters[c as usize].to_string()))
            .collect::<Vec<_>>();
        fields.extend(
            TimingState::iter()
                .map(|t| (t.to_string(), self.durations[t as usize]))
                .filter(|(k, _)| !k.is_empty())
                .map(|(k, d)| (k, format!("{}.{:03}", d.as_secs(), d.subsec_millis()))),
        );
        fields.sort_unstable();
        let body = fields
            .iter()
            .map(|(k, v)| format!("    \"{k}\": {v}"))
            .collect::<Vec<_>>()
            .join(",\n");
        format!("{{\n{body}\n}}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fm::FMBuilder;

    #[test]
    fn json_is_sorted() {
        let s = Stats::new();
        s.count(Counter::SpecializersCreated, 3);
        s.count(Counter::BodiesSpecialized, 1);
        s.count(Counter::BodiesUnspecialized, 2);
        s.count(Counter::RegisterSyncers, 1);
        s.timing_state(TimingState::Generating);
        s.timing_state(TimingState::None);
        let json = s.inner.as_ref().unwrap().lock().unwrap().to_json();
        let fmm = FMBuilder::new(
            r#"{
    "bodies_specialized": 1,
    "bodies_unspecialized": 2,
    "bodies_unsupported": 0,
    "duration_generating": ...
    "register_syncers": 1,
    "specializers_created": 3
}"#,
        )
        .unwrap()
        .build()
        .unwrap();
        if let Err(e) = fmm.matches(&json) {
            panic!("{e}");
        }
    }
}
