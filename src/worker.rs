// Long-lived transport workers on named threads with a cooperative stop flag

use log::{debug, info};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// Longest single sleep between stop flag checks
const NAP_SLICE: Duration = Duration::from_millis(20);

pub struct WorkerHandle {
    name: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))?;
        info!("🚀 Worker '{}' started", name);
        Ok(Self {
            name: name.to_string(),
            stop,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to leave its loop at the next check
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Raise the stop flag and wait for the thread to exit
    pub fn join(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug!("worker '{}' panicked", self.name);
            }
            info!("🛑 Worker '{}' stopped", self.name);
        }
    }
}

// A handle that goes out of scope takes its thread with it
impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Sleep for `duration`, returning early (false) once `stop` is raised
pub fn nap(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(NAP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_stops_a_looping_worker() {
        let worker = WorkerHandle::spawn("looper", |stop| {
            while nap(&stop, Duration::from_secs(1)) {}
        })
        .unwrap();
        assert!(!worker.is_finished());
        let started = Instant::now();
        worker.join();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn dropped_handle_stops_its_worker() {
        let exited = Arc::new(AtomicBool::new(false));
        let seen = exited.clone();
        let worker = WorkerHandle::spawn("dropped", move |stop| {
            while nap(&stop, Duration::from_secs(1)) {}
            seen.store(true, Ordering::Release);
        })
        .unwrap();
        drop(worker);
        assert!(exited.load(Ordering::Acquire));
    }

    #[test]
    fn nap_completes_without_stop() {
        let stop = AtomicBool::new(false);
        assert!(nap(&stop, Duration::from_millis(5)));
        stop.store(true, Ordering::Release);
        assert!(!nap(&stop, Duration::from_secs(5)));
    }
}
