use std::io;
use std::sync::mpsc::{channel, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

enum Task {
    Run(Box<dyn FnOnce() + Send>),
    Quit,
}

/// Cloneable posting side of an [`EventLoop`].
pub(crate) struct LoopHandle {
    tx: Mutex<Sender<Task>>,
}

impl Clone for LoopHandle {
    fn clone(&self) -> LoopHandle {
        LoopHandle {
            tx: Mutex::new(self.tx.lock().unwrap().clone()),
        }
    }
}

impl LoopHandle {
    pub fn post(&self, work: impl FnOnce() + Send + 'static) {
        let _ = self.tx.lock().unwrap().send(Task::Run(Box::new(work)));
    }
}

/// A minimal serial executor.
///
/// The engine funnels every user callback through one of these, so the broker
/// client's network thread never runs user code and callbacks cannot re-enter
/// it. Work posted after the loop quit is silently dropped.
pub(crate) struct EventLoop {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn spawn(name: &str) -> io::Result<EventLoop> {
        let (tx, rx) = channel();

        let thread = thread::Builder::new().name(name.to_owned()).spawn(move || {
            while let Ok(task) = rx.recv() {
                match task {
                    Task::Run(work) => work(),
                    Task::Quit => break,
                }
            }
        })?;

        Ok(EventLoop {
            handle: LoopHandle { tx: Mutex::new(tx) },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let _ = self.handle.tx.lock().unwrap().send(Task::Quit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
