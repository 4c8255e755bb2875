//! Notification thread: one fixed-rate tick loop per reader.

use super::StatsCounters;
use crate::error::{PvError, PvResult};
use crossbeam_channel::{after, select, unbounded, Receiver, Sender};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulerCommand {
    Pause,
    Resume,
    Stop,
}

/// Handle to a running tick loop
pub(crate) struct Scheduler {
    commands: Sender<SchedulerCommand>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Start calling `tick` every `period` on a new thread.
    ///
    /// Ticks never overlap. When a tick overruns, the periods it covered
    /// are dropped and counted in `stats.lagged_ticks`, and the schedule
    /// realigns to the original phase.
    pub fn spawn<F>(
        name: &str,
        period: Duration,
        stats: Arc<StatsCounters>,
        mut tick: F,
    ) -> PvResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(PvError::Configuration(
                "Notification period must be greater than zero".to_string(),
            ));
        }
        // Unbounded: a listener may pause or resume its own reader from the
        // notification thread, which must never block on its own queue
        let (tx, rx) = unbounded::<SchedulerCommand>();
        let thread_name = format!("pv-notify:{}", name);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run(rx, period, &stats, &mut tick))
            .map_err(|e| PvError::Configuration(format!("Failed to start notification thread: {}", e)))?;
        Ok(Self {
            commands: tx,
            handle,
        })
    }

    pub fn pause(&self) {
        let _ = self.commands.send(SchedulerCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(SchedulerCommand::Resume);
    }

    /// Stop the loop and wait for it, unless called from the loop itself
    pub fn stop(self) {
        let _ = self.commands.send(SchedulerCommand::Stop);
        if self.handle.thread().id() == thread::current().id() {
            // Called from a listener: the loop exits once the tick returns
            return;
        }
        if self.handle.join().is_err() {
            tracing::error!("Notification thread panicked");
        }
    }
}

fn run<F: FnMut()>(
    commands: Receiver<SchedulerCommand>,
    period: Duration,
    stats: &StatsCounters,
    tick: &mut F,
) {
    let mut next = Instant::now() + period;
    let mut paused = false;

    loop {
        if paused {
            match commands.recv() {
                Ok(SchedulerCommand::Resume) => {
                    paused = false;
                    next = Instant::now() + period;
                }
                Ok(SchedulerCommand::Pause) => {}
                Ok(SchedulerCommand::Stop) | Err(_) => break,
            }
            continue;
        }

        let wait = next.saturating_duration_since(Instant::now());
        select! {
            recv(commands) -> command => match command {
                Ok(SchedulerCommand::Pause) => paused = true,
                Ok(SchedulerCommand::Resume) => {}
                Ok(SchedulerCommand::Stop) | Err(_) => break,
            },
            recv(after(wait)) -> _ => {
                tick();
                next += period;
                let now = Instant::now();
                if next <= now {
                    let behind = now - next;
                    let dropped = (behind.as_nanos() / period.as_nanos()) as u64 + 1;
                    stats.lagged_ticks.fetch_add(dropped, Ordering::Relaxed);
                    tracing::warn!(
                        "Tick overran its period of {:?}; dropping {} tick(s)",
                        period,
                        dropped
                    );
                    next += period * dropped as u32;
                }
            },
        }
    }
    tracing::debug!("Notification thread exiting");
}
