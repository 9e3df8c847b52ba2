use std::thread::JoinHandle;
use std::time::Duration;

use flume::{RecvTimeoutError, Sender};

use crate::errors::Result;

/// Background thread that calls `tick` every `interval` until dropped.
///
/// The sweep threads only ever enqueue work onto owning threads; they never
/// touch native state themselves.
pub(crate) struct SweepThread {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SweepThread {
    pub(crate) fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let handle = std::thread::Builder::new().name(name.to_string()).spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for SweepThread {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel and wakes the thread.
        self.stop.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("Sweep thread panicked");
        }
    }
}
