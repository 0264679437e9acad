//! A thread pool which runs a closure in parallel.
//!
//! Ported from the teacher's `src/tools/parallel_handler.rs`; used wherever
//! the spec calls for "a bounded worker pool" -- the Flushable Cache's
//! `flushDegreeOfParallelism` persistence fan-out (§4.2) and the Checkpoint
//! Manager's per-file upload fan-out (§4.3).

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, Sender};

/// A handle to send data to the worker threads (implements clone).
pub struct SendHandle<I> {
    input: Sender<I>,
    abort: Arc<Mutex<Option<String>>>,
}

/// Returns the first error that happened, if any.
pub fn check_abort(abort: &Mutex<Option<String>>) -> Result<(), Error> {
    let guard = abort.lock().unwrap();
    if let Some(err_msg) = &*guard {
        return Err(format_err!("{}", err_msg));
    }
    Ok(())
}

impl<I: Send> SendHandle<I> {
    pub fn send(&self, input: I) -> Result<(), Error> {
        check_abort(&self.abort)?;
        match self.input.send(input) {
            Ok(()) => Ok(()),
            Err(_) => bail!("send failed - channel closed"),
        }
    }
}

impl<I> Clone for SendHandle<I> {
    fn clone(&self) -> Self {
        Self { input: self.input.clone(), abort: Arc::clone(&self.abort) }
    }
}

/// A thread pool which runs the supplied closure on each item sent to it.
///
/// If one handler invocation returns an error, the channel is marked
/// failed and no further sends succeed. Call `complete()` to wait for the
/// pool to drain and check for outstanding errors.
pub struct ParallelHandler<I> {
    handles: Vec<JoinHandle<()>>,
    name: String,
    input: Option<SendHandle<I>>,
}

impl<I: Send + 'static> ParallelHandler<I> {
    pub fn new<F>(name: &str, threads: usize, handler_fn: F) -> Self
    where
        F: Fn(I) -> Result<(), Error> + Send + Clone + 'static,
    {
        let mut handles = Vec::new();
        let (input_tx, input_rx) = bounded::<I>(threads.max(1));
        let abort = Arc::new(Mutex::new(None));

        for i in 0..threads.max(1) {
            let input_rx = input_rx.clone();
            let abort = Arc::clone(&abort);
            let handler_fn = handler_fn.clone();

            handles.push(
                std::thread::Builder::new()
                    .name(format!("{name} ({i})"))
                    .spawn(move || loop {
                        let data = match input_rx.recv() {
                            Ok(data) => data,
                            Err(_) => return,
                        };
                        if let Err(err) = (handler_fn)(data) {
                            let mut guard = abort.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(err.to_string());
                            }
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }

        Self { handles, name: name.to_string(), input: Some(SendHandle { input: input_tx, abort }) }
    }

    pub fn channel(&self) -> SendHandle<I> {
        self.input.as_ref().unwrap().clone()
    }

    pub fn send(&self, input: I) -> Result<(), Error> {
        self.input.as_ref().unwrap().send(input)
    }

    pub fn complete(mut self) -> Result<(), Error> {
        let input = self.input.take().unwrap();
        let abort = Arc::clone(&input.abort);
        check_abort(&abort)?;
        drop(input);

        let msg_list = self.join_threads();
        check_abort(&abort)?;

        if msg_list.is_empty() {
            return Ok(());
        }
        Err(format_err!("{}", msg_list.join("\n")))
    }

    fn join_threads(&mut self) -> Vec<String> {
        let mut msg_list = Vec::new();
        let mut i = 0;
        while let Some(handle) = self.handles.pop() {
            if let Err(panic) = handle.join() {
                match panic.downcast::<&str>() {
                    Ok(panic_msg) => {
                        msg_list.push(format!("thread {} ({}) panicked: {}", self.name, i, panic_msg))
                    }
                    Err(_) => msg_list.push(format!("thread {} ({}) panicked", self.name, i)),
                }
            }
            i += 1;
        }
        msg_list
    }
}
