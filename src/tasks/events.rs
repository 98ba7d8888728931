//! Status-change events and their delivery to observers.
//!
//! Every `TaskContext` mutation produces a `TaskEvent`. Events are pushed onto
//! an unbounded queue drained by a single dispatcher thread, so observer
//! callbacks never run on (or slow down) a runner thread, and events of one
//! context reach observers in the order they were produced. The same events
//! are also fanned out on a broadcast channel for async subscribers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::tasks::context::TaskContext;
use crate::tasks::state::TaskSnapshot;

/// What changed on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEventKind {
    /// Bound to a runner.
    Started,
    Progress,
    Busy,
    Cancellable,
    Caption,
    /// Returned `Continue` and went back to the pending queue.
    Requeued,
    /// Reached its terminal state.
    Finished,
}

/// A single context state change.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    /// Live handle to the context that changed.
    pub context: TaskContext,
    /// State of the context right after the change.
    pub snapshot: TaskSnapshot,
}

/// Handle returned by `TaskManager::register_observer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Observer callback. May be invoked on any thread.
pub type Observer = dyn Fn(&TaskEvent) + Send + Sync;

pub(crate) enum Dispatch {
    Event(TaskEvent),
    Stop,
}

/// Sending half shared by the manager and every context it creates.
#[derive(Clone)]
pub(crate) struct EventBus {
    queue: mpsc::UnboundedSender<Dispatch>,
    broadcast: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<Dispatch>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let (broadcast, _rx) = broadcast::channel(capacity.max(1));
        (Self { queue, broadcast }, rx)
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        // Broadcast, ok if no receivers are listening
        let _ = self.broadcast.send(event.clone());
        // Dispatcher gone means the manager shut down; nobody is observing
        let _ = self.queue.send(Dispatch::Event(event));
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.broadcast.subscribe()
    }

    pub(crate) fn stop(&self) {
        let _ = self.queue.send(Dispatch::Stop);
    }
}

/// Registered observer callbacks.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    list: RwLock<Vec<(ObserverId, Arc<Observer>)>>,
}

impl Observers {
    pub(crate) fn register(&self, callback: Arc<Observer>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.list.write().push((id, callback));
        debug!(observer = id.0, "Observer registered");
        id
    }

    pub(crate) fn unregister(&self, id: ObserverId) -> bool {
        let mut list = self.list.write();
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.list.read().len()
    }

    /// Invoke every observer with `event`.
    ///
    /// Callbacks run on a copy of the list so they may register or
    /// unregister observers themselves.
    fn deliver(&self, event: &TaskEvent) {
        let callbacks: Vec<Arc<Observer>> =
            self.list.read().iter().map(|(_, cb)| Arc::clone(cb)).collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(
                    task_id = %event.snapshot.id,
                    kind = ?event.kind,
                    "Observer panicked while handling task event"
                );
            }
        }
    }
}

/// Start the thread that drains `rx` into `observers` until `Dispatch::Stop`.
pub(crate) fn spawn_dispatcher(
    name: String,
    observers: Arc<Observers>,
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name(name).spawn(move || {
        while let Some(dispatch) = rx.blocking_recv() {
            match dispatch {
                Dispatch::Event(event) => observers.deliver(&event),
                Dispatch::Stop => break,
            }
        }
        debug!("Task event dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn event(bus: &EventBus) -> TaskEvent {
        let ctx = TaskContext::detached("probe", bus.clone());
        TaskEvent {
            kind: TaskEventKind::Caption,
            snapshot: ctx.snapshot(),
            context: ctx,
        }
    }

    #[test]
    fn register_and_unregister() {
        let observers = Observers::default();
        let a = observers.register(Arc::new(|_: &TaskEvent| {}));
        let b = observers.register(Arc::new(|_: &TaskEvent| {}));
        assert_ne!(a, b);
        assert_eq!(observers.len(), 2);

        assert!(observers.unregister(a));
        assert!(!observers.unregister(a));
        assert_eq!(observers.len(), 1);
    }

    fn exploding(_: &TaskEvent) {
        panic!("observer bug");
    }

    #[test]
    fn panicking_observer_does_not_stop_delivery() {
        let (bus, _rx) = EventBus::new(8);
        let observers = Observers::default();
        let calls = Arc::new(AtomicUsize::new(0));

        observers.register(Arc::new(exploding));
        let counter = Arc::clone(&calls);
        observers.register(Arc::new(move |_: &TaskEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        observers.deliver(&event(&bus));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatcher_delivers_in_order_and_stops() {
        let (bus, rx) = EventBus::new(8);
        let observers = Arc::new(Observers::default());
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        observers.register(Arc::new(move |e: &TaskEvent| {
            let _ = seen_tx.send(e.snapshot.action_caption.clone());
        }));

        let handle = spawn_dispatcher("test-dispatch".into(), Arc::clone(&observers), rx).unwrap();

        let ctx = TaskContext::detached("probe", bus.clone());
        ctx.set_action_caption("one");
        ctx.set_action_caption("two");

        let timeout = Duration::from_secs(5);
        assert_eq!(seen_rx.recv_timeout(timeout).unwrap(), "one");
        assert_eq!(seen_rx.recv_timeout(timeout).unwrap(), "two");

        bus.stop();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn broadcast_subscribers_see_events() {
        let (bus, _rx) = EventBus::new(8);
        let mut sub = bus.subscribe();

        let ctx = TaskContext::detached("probe", bus.clone());
        ctx.set_busy(true);

        let received = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind, TaskEventKind::Busy);
        assert!(received.snapshot.busy);
    }
}
