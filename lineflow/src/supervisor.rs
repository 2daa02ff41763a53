//! Component threads and their exit reports.
//!
//! The ingester and every query worker run on a named thread spawned by a
//! [`Supervisor`]. When a component's thread ends, for whatever reason, a
//! [`ComponentExit`] is sent back. Components that finish cleanly are
//! logged and the rest keep running; the first failure decides the
//! process's fate.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::error::{LineflowError, Result};

/// How a component ended.
#[derive(Debug)]
pub enum ExitOutcome {
    /// The component finished its work.
    Finished,
    /// The component returned an error.
    Failed(LineflowError),
    /// The component's thread panicked.
    Panicked(String),
}

/// Report sent when a component's thread ends.
#[derive(Debug)]
pub struct ComponentExit {
    /// Thread name of the component.
    pub component: String,
    /// How it ended.
    pub outcome: ExitOutcome,
}

impl ComponentExit {
    /// Returns `true` unless the component failed or panicked.
    pub fn is_clean(&self) -> bool {
        matches!(self.outcome, ExitOutcome::Finished)
    }
}

/// Spawns component threads and collects their exits.
#[derive(Debug)]
pub struct Supervisor {
    tx: Sender<ComponentExit>,
    rx: Receiver<ComponentExit>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Creates a supervisor with no components.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            handles: Vec::new(),
        }
    }

    /// Runs `component` on a new thread called `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to create the thread.
    pub fn spawn<F>(&mut self, name: impl Into<String>, component: F) -> std::io::Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let tx = self.tx.clone();
        let component_name = name.clone();

        let handle = thread::Builder::new().name(name).spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(component)) {
                Ok(Ok(())) => ExitOutcome::Finished,
                Ok(Err(e)) => ExitOutcome::Failed(e),
                Err(payload) => ExitOutcome::Panicked(panic_message(payload.as_ref())),
            };
            // The receiver is gone once the supervisor stopped waiting.
            let _ = tx.send(ComponentExit {
                component: component_name,
                outcome,
            });
        })?;

        self.handles.push(handle);
        Ok(())
    }

    /// Number of components spawned.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if nothing was spawned.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Blocks until a component fails or panics and returns its report.
    ///
    /// Clean exits are logged and waiting continues. Returns `None` once
    /// every component has finished cleanly, or at once if nothing was
    /// spawned. Threads still running when this returns end with the
    /// process.
    pub fn wait_for_failure(self) -> Option<ComponentExit> {
        drop(self.tx);
        for exit in self.rx.iter() {
            if !exit.is_clean() {
                return Some(exit);
            }
            tracing::info!("{} finished", exit.component);
        }
        None
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::QueryError;

    #[test]
    fn test_first_failure_wins() {
        let mut supervisor = Supervisor::new();
        supervisor
            .spawn("slow", || {
                thread::sleep(Duration::from_secs(5));
                Ok(())
            })
            .unwrap();
        supervisor
            .spawn("network_throughput.receive", || {
                Err(QueryError::StreamEnded { rows: 3 }.into())
            })
            .unwrap();
        assert_eq!(supervisor.len(), 2);

        let exit = supervisor.wait_for_failure().unwrap();
        assert_eq!(exit.component, "network_throughput.receive");
        assert!(!exit.is_clean());
        assert!(matches!(
            exit.outcome,
            ExitOutcome::Failed(LineflowError::Query(QueryError::StreamEnded { rows: 3 }))
        ));
    }

    #[test]
    fn test_clean_exit_keeps_waiting_for_others() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("ingester", || Ok(())).unwrap();
        supervisor
            .spawn("power.total", || {
                thread::sleep(Duration::from_millis(100));
                Err(QueryError::StreamEnded { rows: 0 }.into())
            })
            .unwrap();

        let exit = supervisor.wait_for_failure().unwrap();
        assert_eq!(exit.component, "power.total");
        assert!(matches!(
            exit.outcome,
            ExitOutcome::Failed(LineflowError::Query(QueryError::StreamEnded { rows: 0 }))
        ));
    }

    #[test]
    fn test_all_clean_exits() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("ingester", || Ok(())).unwrap();
        supervisor.spawn("line-check", || Ok(())).unwrap();

        assert!(supervisor.wait_for_failure().is_none());
    }

    #[test]
    fn test_panic_is_reported() {
        let mut supervisor = Supervisor::new();
        supervisor
            .spawn("boom", || panic!("counter went backwards"))
            .unwrap();

        let exit = supervisor.wait_for_failure().unwrap();
        assert_eq!(exit.component, "boom");
        assert!(
            matches!(exit.outcome, ExitOutcome::Panicked(ref msg) if msg == "counter went backwards")
        );
    }

    #[test]
    fn test_nothing_spawned() {
        assert!(Supervisor::new().wait_for_failure().is_none());
    }
}
