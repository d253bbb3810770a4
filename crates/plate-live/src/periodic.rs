//! Background jobs that run on a fixed interval until stopped or dropped.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

pub struct PeriodicTask {
    name: String,
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Run `tick` every `interval`, first after one full interval. Returns
    /// `None` if the thread could not be spawned.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Option<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread_name = name.to_string();
        let spawned = thread::Builder::new()
            .name(format!("plate-{}", name))
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!(task = %thread_name, "periodic task stopped");
                        break;
                    }
                }
            });
        match spawned {
            Ok(handle) => Some(Self {
                name: name.to_string(),
                stop: Some(stop),
                handle: Some(handle),
            }),
            Err(err) => {
                error!(task = name, error = %err, "failed to spawn periodic task");
                None
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            // The last owner can be dropped from inside its own tick.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(task = %self.name, "periodic task panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut task = PeriodicTask::spawn("test-ticker", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("spawned");
        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "ticker never ran");
            thread::sleep(Duration::from_millis(2));
        }
        task.stop();
        let after_stop = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
        assert_eq!(task.name(), "test-ticker");
    }

    #[test]
    fn drop_stops_without_waiting_for_interval() {
        let started = Instant::now();
        let task = PeriodicTask::spawn("slow", Duration::from_secs(3600), || {}).expect("spawned");
        drop(task);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
