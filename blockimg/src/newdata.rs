// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Background delivery of the "new data" stream. All of the data for all
//! `new` commands is one concatenated stream, packed in the order the
//! transfer list consumes it. A single background thread reads (and
//! implicitly decompresses, depending on the source the caller hands over)
//! that stream for the lifetime of one engine invocation.
//!
//! The handshake is a single-slot rendezvous: the main thread publishes a
//! [`RangeSink`] for one `new` command and blocks; the background thread
//! fills the sink and clears the slot when the sink is satisfied. At most one
//! request is ever outstanding, which keeps delivery strictly in transfer
//! list order. This must not be widened into a queue.

use std::{
    io::{self, Read},
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

use thiserror::Error;
use tracing::warn;

use crate::sink::{self, RangeSink};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing {0} bytes of new data")]
    MissingData(u64),
    #[error("Failed to read new data stream")]
    Read(#[source] io::Error),
    #[error("Range sink error")]
    Sink(#[from] sink::Error),
}

type Result<T> = std::result::Result<T, Error>;

struct Slot {
    sink: Option<RangeSink>,
    /// False once either side has left the handshake for good.
    alive: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    cond: Condvar,
}

/// Handle to the background thread owned by the main thread.
pub struct Streamer {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Streamer {
    pub fn spawn(source: impl Read + Send + 'static) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                sink: None,
                alive: true,
            }),
            cond: Condvar::new(),
        });

        let handle = {
            let shared = shared.clone();
            thread::spawn(move || run_producer(source, &shared))
        };

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Publish a sink for the next `new` command and block until the
    /// background thread has fully satisfied it.
    pub fn feed(&self, sink: RangeSink) -> Result<()> {
        let mut slot = self.shared.slot.lock().unwrap();
        slot.sink = Some(sink);
        self.shared.cond.notify_all();

        while slot.sink.is_some() {
            if !slot.alive {
                let missing = slot.sink.as_ref().map(RangeSink::available).unwrap_or(0);
                slot.sink = None;
                return Err(Error::MissingData(missing));
            }
            slot = self.shared.cond.wait(slot).unwrap();
        }

        Ok(())
    }

    /// Shut down the handshake and join the background thread, surfacing any
    /// error it hit. If the stream still held unconsumed data, that's a
    /// producer-side packing bug worth a warning, not a failure.
    pub fn finish(mut self) -> Result<()> {
        {
            let mut slot = self.shared.slot.lock().unwrap();
            if slot.alive {
                warn!("New data stream still has unconsumed data");
            }
            slot.alive = false;
            self.shared.cond.notify_all();
        }

        match self.handle.take().unwrap().join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        // Error-path cleanup: unblock and detach the producer.
        if let Some(handle) = self.handle.take() {
            {
                let mut slot = self.shared.slot.lock().unwrap();
                slot.alive = false;
                self.shared.cond.notify_all();
            }
            let _ = handle.join();
        }
    }
}

fn run_producer(mut source: impl Read, shared: &Shared) -> Result<()> {
    let mut buf = vec![0u8; 32 * 1024];

    let result = loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(Error::Read(e)),
        };

        let mut data = &buf[..n];

        while !data.is_empty() {
            let mut slot = shared.slot.lock().unwrap();

            while slot.sink.is_none() {
                if !slot.alive {
                    // The consumer is done with us; drop the rest.
                    return Ok(());
                }
                slot = shared.cond.wait(slot).unwrap();
            }

            let sink = slot.sink.as_mut().unwrap();
            let take = (sink.available()).min(data.len() as u64) as usize;

            if let Err(e) = sink.write_all(&data[..take]) {
                slot.alive = false;
                shared.cond.notify_all();
                return Err(e.into());
            }

            data = &data[take..];

            if sink.finished() {
                slot.sink = None;
                shared.cond.notify_all();
            }
        }
    };

    let mut slot = shared.slot.lock().unwrap();
    slot.alive = false;
    shared.cond.notify_all();

    result
}
