//! Push-based event bus for inbound messages.
//!
//! Each event kind is a [`Signal`]: a set of listeners invoked synchronously,
//! in registration order, whenever the signal is emitted. Listeners run
//! outside the signal's lock, so a listener may subscribe or unsubscribe
//! (including itself) while being invoked.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use crate::stream::message::Message;

new_key_type! {
    /// Identifies one registered listener.
    pub struct ListenerId;
}

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Listener<A: ?Sized> {
    callback: Callback<A>,
    once: bool,
}

type Listeners<A> = Mutex<SlotMap<ListenerId, Listener<A>>>;

/// A fan-out of listeners for one event kind.
pub struct Signal<A: ?Sized + 'static> {
    listeners: Arc<Listeners<A>>,
}

impl<A: ?Sized + 'static> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ?Sized + 'static> Signal<A> {
    /// Creates a signal with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(SlotMap::with_key())),
        }
    }

    /// Registers `listener` for every emission until unsubscribed.
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.insert(Arc::new(listener), false)
    }

    /// Registers `listener` for the next emission only.
    ///
    /// The listener is removed before it runs, so concurrent emissions can
    /// never invoke it twice.
    pub fn once<F>(&self, listener: F) -> Subscription
    where
        F: FnOnce(&A) + Send + 'static,
    {
        let slot = Mutex::new(Some(listener));
        self.insert(
            Arc::new(move |args: &A| {
                if let Some(listener) = slot.lock().take() {
                    listener(args);
                }
            }),
            true,
        )
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Invokes every listener registered at the time of the call.
    pub fn emit(&self, args: &A) {
        let callbacks: Vec<Callback<A>> = {
            let mut listeners = self.listeners.lock();
            let mut callbacks = Vec::with_capacity(listeners.len());
            let mut fired_once = Vec::new();
            for (id, listener) in listeners.iter() {
                callbacks.push(Arc::clone(&listener.callback));
                if listener.once {
                    fired_once.push(id);
                }
            }
            for id in fired_once {
                listeners.remove(id);
            }
            callbacks
        };

        for callback in callbacks {
            callback(args);
        }
    }

    fn insert(&self, callback: Callback<A>, once: bool) -> Subscription {
        let id = self.listeners.lock().insert(Listener { callback, once });
        let weak: Weak<Listeners<A>> = Arc::downgrade(&self.listeners);
        Subscription {
            id,
            remove: Box::new(move |id: ListenerId| {
                weak.upgrade()
                    .is_some_and(|listeners| listeners.lock().remove(id).is_some())
            }),
        }
    }
}

impl<A: ?Sized + 'static> std::fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle returned when registering a listener.
///
/// Dropping the handle keeps the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    id: ListenerId,
    remove: Box<dyn Fn(ListenerId) -> bool + Send + Sync>,
}

impl Subscription {
    /// Identifier of the registered listener.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Removes the listener.
    ///
    /// Returns `false` if it was already gone (for example a `once` listener
    /// that has fired).
    pub fn unsubscribe(self) -> bool {
        (self.remove)(self.id)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// The three inbound message events of a stream client.
#[derive(Debug, Default)]
pub struct EventBus {
    /// Every inbound message.
    pub message: Signal<Message>,
    /// Payload of inbound text messages.
    pub text: Signal<str>,
    /// Payload of inbound binary messages.
    pub binary: Signal<[u8]>,
}

impl EventBus {
    /// Creates a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits `message`, then the kind-specific event for its payload.
    pub(crate) fn dispatch(&self, message: &Message) {
        self.message.emit(message);
        match message {
            Message::Text(text) => self.text.emit(text.as_str()),
            Message::Binary(data) => self.binary.emit(data.as_slice()),
        }
    }
}
