//! Client display status machine.
//!
//! A small finite-state automaton guarding the UI against nonsensical
//! transitions (PLAY before READY, PAUSE while idle). Unknown
//! transitions are refused and logged; accepted ones notify a single
//! display observer with the new state and its human label.

use thiserror::Error;

/// Display states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Nothing loaded yet.
    #[default]
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
}

impl Status {
    /// Label shown to the user alongside the state.
    #[must_use]
    pub fn human_label(&self) -> &'static str {
        match self {
            Self::Idle => "\u{2014}",
            Self::Loading => "Loading\u{2026}",
            Self::Ready => "Ready",
            Self::Playing => "Playing",
            Self::Paused => "Paused",
        }
    }
}

/// Events driving the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// A new track started loading.
    Load,
    /// Loading finished; playback may begin.
    AutoReady,
    Play,
    Pause,
    /// Loading failed; fall back to idle.
    Error,
}

/// A transition the table does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("refused transition: {event:?} in {from:?}")]
pub struct RefusedTransition {
    pub from: Status,
    pub event: StatusEvent,
}

type DisplayObserver = Box<dyn Fn(Status, &str) + Send>;

/// The automaton plus its single display observer.
#[derive(Default)]
pub struct StatusMachine {
    state: Status,
    observer: Option<DisplayObserver>,
}

impl StatusMachine {
    /// Creates a machine in the idle state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the display observer, replacing any previous one.
    pub fn on_change(&mut self, observer: impl Fn(Status, &str) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> Status {
        self.state
    }

    /// Applies an event.
    ///
    /// # Errors
    ///
    /// `RefusedTransition` for any pair outside the table; the state is
    /// left unchanged and the refusal logged.
    pub fn apply(&mut self, event: StatusEvent) -> Result<Status, RefusedTransition> {
        use Status::*;
        use StatusEvent::*;

        let next = match (self.state, event) {
            (_, Load) => Loading,
            (Loading, AutoReady) => Ready,
            (Loading, Error) => Idle,
            (Ready, Play) | (Paused, Play) => Playing,
            (Playing, Pause) => Paused,
            (from, event) => {
                let refused = RefusedTransition { from, event };
                log::warn!("[Status] {refused}");
                return Err(refused);
            }
        };

        self.state = next;
        if let Some(observer) = &self.observer {
            observer(next, next.human_label());
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn happy_path_load_ready_play_pause_play() {
        let mut machine = StatusMachine::new();
        assert_eq!(machine.apply(StatusEvent::Load).unwrap(), Status::Loading);
        assert_eq!(machine.apply(StatusEvent::AutoReady).unwrap(), Status::Ready);
        assert_eq!(machine.apply(StatusEvent::Play).unwrap(), Status::Playing);
        assert_eq!(machine.apply(StatusEvent::Pause).unwrap(), Status::Paused);
        assert_eq!(machine.apply(StatusEvent::Play).unwrap(), Status::Playing);
    }

    #[test]
    fn play_before_ready_is_refused() {
        let mut machine = StatusMachine::new();
        let refused = machine.apply(StatusEvent::Play).unwrap_err();
        assert_eq!(refused.from, Status::Idle);
        assert_eq!(machine.state(), Status::Idle);

        machine.apply(StatusEvent::Load).unwrap();
        assert!(machine.apply(StatusEvent::Play).is_err());
        assert_eq!(machine.state(), Status::Loading);
    }

    #[test]
    fn load_is_valid_from_every_state() {
        for setup in [
            vec![],
            vec![StatusEvent::Load],
            vec![StatusEvent::Load, StatusEvent::AutoReady],
            vec![StatusEvent::Load, StatusEvent::AutoReady, StatusEvent::Play],
            vec![
                StatusEvent::Load,
                StatusEvent::AutoReady,
                StatusEvent::Play,
                StatusEvent::Pause,
            ],
        ] {
            let mut machine = StatusMachine::new();
            for event in setup {
                machine.apply(event).unwrap();
            }
            assert_eq!(machine.apply(StatusEvent::Load).unwrap(), Status::Loading);
        }
    }

    #[test]
    fn error_only_resets_loading() {
        let mut machine = StatusMachine::new();
        assert!(machine.apply(StatusEvent::Error).is_err());

        machine.apply(StatusEvent::Load).unwrap();
        assert_eq!(machine.apply(StatusEvent::Error).unwrap(), Status::Idle);
    }

    #[test]
    fn pause_requires_playing() {
        let mut machine = StatusMachine::new();
        machine.apply(StatusEvent::Load).unwrap();
        machine.apply(StatusEvent::AutoReady).unwrap();
        assert!(machine.apply(StatusEvent::Pause).is_err());
    }

    #[test]
    fn auto_ready_requires_loading() {
        let mut machine = StatusMachine::new();
        assert!(machine.apply(StatusEvent::AutoReady).is_err());
    }

    #[test]
    fn observer_sees_state_and_label() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let mut machine = StatusMachine::new();
        machine.on_change(move |state, label| {
            if state == Status::Loading {
                assert_eq!(label, "Loading\u{2026}");
            }
            seen_clone.fetch_add(1, Ordering::Relaxed);
        });

        machine.apply(StatusEvent::Load).unwrap();
        machine.apply(StatusEvent::AutoReady).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 2);

        // Refused transitions do not notify
        let _ = machine.apply(StatusEvent::AutoReady);
        assert_eq!(seen.load(Ordering::Relaxed), 2);
    }
}
