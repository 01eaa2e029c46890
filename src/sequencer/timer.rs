//! Periodic timer service used to clock the sequencer.
//!
//! The engine needs two independent periodic timers (the step clock and the
//! voice-alternation clock). It only talks to them through [`TimerService`]
//! and [`PeriodicTimer`], so the clock source can be a hardware timer, a
//! thread, or a hand-cranked test double.

use crate::error::TimerError;
use crossbeam_channel::{select, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Callback invoked on every timer period, from the timer's own context.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A timer created by a [`TimerService`]. Inert until started.
pub trait PeriodicTimer: Send {
    /// Starts (or restarts) firing the callback every `period`.
    fn start_periodic(&mut self, period: Duration) -> Result<(), TimerError>;

    /// Stops firing. Stopping a stopped timer does nothing.
    ///
    /// Must not wait for an in-flight callback to finish: the callback itself
    /// may be the caller.
    fn stop(&mut self);

    /// Returns true while the timer is started.
    fn is_running(&self) -> bool;
}

/// Creates periodic timers.
pub trait TimerService: Send + Sync {
    /// Creates a named timer that will invoke `callback` once started.
    fn create(
        &self,
        name: &'static str,
        callback: TimerCallback,
    ) -> Result<Box<dyn PeriodicTimer>, TimerError>;
}

/// Timer service backed by one OS thread per running timer.
///
/// Each start spawns a thread that waits on a crossbeam ticker; stopping
/// disconnects the thread's control channel and lets it exit on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTimerService;

impl TimerService for ThreadTimerService {
    fn create(
        &self,
        name: &'static str,
        callback: TimerCallback,
    ) -> Result<Box<dyn PeriodicTimer>, TimerError> {
        Ok(Box::new(ThreadTimer {
            name,
            callback,
            run: None,
        }))
    }
}

/// Handle to a running timer thread.
struct TimerRun {
    /// Dropping this disconnects the thread's control channel.
    _control: Sender<()>,
    /// Cleared on stop so a tick racing the disconnect is not delivered.
    active: Arc<AtomicBool>,
}

struct ThreadTimer {
    name: &'static str,
    callback: TimerCallback,
    run: Option<TimerRun>,
}

impl PeriodicTimer for ThreadTimer {
    fn start_periodic(&mut self, period: Duration) -> Result<(), TimerError> {
        self.stop();

        if period.is_zero() {
            return Err(TimerError::Start {
                name: self.name,
                reason: "zero period".to_string(),
            });
        }

        let (control_tx, control_rx) = crossbeam_channel::bounded::<()>(0);
        let active = Arc::new(AtomicBool::new(true));
        let ticker = crossbeam_channel::tick(period);
        let callback = Arc::clone(&self.callback);
        let thread_active = Arc::clone(&active);

        thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => {
                        if !thread_active.load(Ordering::Acquire) {
                            break;
                        }
                        callback();
                    }
                    recv(control_rx) -> _ => break,
                }
            })
            .map_err(|e| TimerError::Start {
                name: self.name,
                reason: e.to_string(),
            })?;

        tracing::trace!("Timer '{}' started, period {:?}", self.name, period);
        self.run = Some(TimerRun {
            _control: control_tx,
            active,
        });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            run.active.store(false, Ordering::Release);
            tracing::trace!("Timer '{}' stopped", self.name);
        }
    }

    fn is_running(&self) -> bool {
        self.run.is_some()
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
