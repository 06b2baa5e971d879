use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Persistent callbacks invoked in registration order.
#[derive(Default)]
pub struct CallbackList {
    next_id: u64,
    callbacks: Vec<(CallbackId, Box<dyn FnMut()>)>,
}

impl fmt::Debug for CallbackList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackList")
            .field("len", &self.callbacks.len())
            .finish()
    }
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, callback: impl FnMut() + 'static) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(existing, _)| *existing != id);
        self.callbacks.len() != before
    }

    pub fn call_all(&mut self) {
        for (_, callback) in &mut self.callbacks {
            callback();
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

type DeferredTask = Box<dyn FnOnce()>;

/// Cloneable queue of one-shot tasks.
///
/// `run` takes the queue before invoking anything, so a task that defers
/// another waits for the next run.
#[derive(Clone, Default)]
pub struct DeferredTasks {
    queue: Rc<RefCell<Vec<DeferredTask>>>,
}

impl fmt::Debug for DeferredTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTasks")
            .field("pending", &self.len())
            .finish()
    }
}

impl DeferredTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.queue.borrow_mut().push(Box::new(task));
    }

    /// Returns the number of tasks run.
    pub fn run(&self) -> usize {
        let tasks = mem::take(&mut *self.queue.borrow_mut());
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}
