//! Module `thread` implement a generic multi-threading pattern.
//!
//! It is inspired from gen-server model from Erlang, where by, every thread is
//! expected to hold onto its own state, and handle all inter-thread communication
//! via channels and message queues. Background index builds run as one such
//! thread per build.

use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        mpsc, Arc, Mutex,
    },
    thread,
};

use crate::{Error, Result};

/// Thread type, providing gen-server pattern to do multi-threading.
///
/// NOTE: When a thread value is dropped, it is made sure that there are no dangling
/// thread routines. To achieve this following requirements need to be satisfied:
///
/// * The thread's main loop should handle _disconnect_ signal on its [Rx] channel.
/// * Call `join()` on the [Thread] instance.
pub struct Thread<Q, T = ()> {
    name: String,
    inner: Option<Inner<Q, T>>,
}

struct Inner<Q, T> {
    handle: thread::JoinHandle<T>,
    tx: Option<Arc<Mutex<Tx<Q>>>>,
    done: Arc<AtomicBool>,
}

impl<Q, T> Inner<Q, T> {
    fn join(mut self) -> Result<T> {
        mem::drop(self.tx.take());

        match self.handle.join() {
            Ok(val) => Ok(val),
            Err(err) => err_at!(ThreadFail, msg: "fail {:?}", err),
        }
    }
}

impl<Q, T> Drop for Thread<Q, T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.join().ok();
        }
    }
}

impl<Q, T> Thread<Q, T> {
    /// Create a new Thread instance, using asynchronous channel with infinite buffer.
    /// `main_loop` shall be called with the rx side of the channel and shall return
    /// a function that can be spawned using thread::spawn.
    pub fn new<F, N>(name: &str, main_loop: F) -> Thread<Q, T>
    where
        F: 'static + FnOnce(Rx<Q>) -> N + Send,
        N: 'static + Send + FnOnce() -> T,
        T: 'static + Send,
    {
        let (tx, rx) = mpsc::channel();
        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let (main_loop, done) = (main_loop(rx), Arc::clone(&done));
            thread::spawn(move || {
                let res = main_loop();
                done.store(true, SeqCst);
                res
            })
        };

        Thread {
            name: name.to_string(),
            inner: Some(Inner {
                handle,
                tx: Some(Arc::new(Mutex::new(Tx(tx)))),
                done,
            }),
        }
    }

    /// Recommended way to exit/shutdown the thread. Note that all [Tx] clones of this
    /// thread must also be dropped for this call to return.
    ///
    /// Even otherwise, when Thread value goes out of scope its drop implementation
    /// shall call this method to exit the thread, except that any errors are ignored.
    pub fn join(mut self) -> Result<T> {
        match self.inner.take() {
            Some(inner) => inner.join(),
            None => err_at!(ThreadFail, msg: "thread {} already joined", self.name),
        }
    }

    /// Return whether the thread's main loop has returned.
    pub fn is_finished(&self) -> bool {
        match self.inner.as_ref() {
            Some(inner) => inner.done.load(SeqCst),
            None => true,
        }
    }

    /// Return name of this thread.
    pub fn to_name(&self) -> String {
        self.name.to_string()
    }

    /// Return a clone of tx channel.
    pub fn to_tx(&self) -> Result<Tx<Q>> {
        match self.inner.as_ref().and_then(|inner| inner.tx.as_ref()) {
            Some(tx) => Ok(err_at!(IPCFail, tx.lock())?.clone()),
            None => err_at!(IPCFail, msg: "thread {} is closed", self.name),
        }
    }
}

/// IPC type, wrapping the [mpsc::Sender] side of a thread's channel.
pub struct Tx<Q>(mpsc::Sender<Q>);

impl<Q> Clone for Tx<Q> {
    fn clone(&self) -> Self {
        Tx(self.0.clone())
    }
}

impl<Q> Tx<Q> {
    /// Post a message to thread and don't wait for response. Fails if the
    /// thread's main loop has exited.
    pub fn post(&self, msg: Q) -> Result<()> {
        err_at!(IPCFail, self.0.send(msg))
    }
}

/// IPC type, that shall be passed to the thread's main loop.
///
/// Refer to [Thread::new] for details.
pub type Rx<Q> = mpsc::Receiver<Q>;

#[cfg(test)]
#[path = "thread_test.rs"]
mod thread_test;
