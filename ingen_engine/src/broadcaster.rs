//! Fan-out of engine notifications to subscribed clients.

use std::sync::Mutex;

use ingen_core::{Atom, Path, Properties, Status, Uri};

/// Identifies a subscribed client; 0 means "no client" (internally
/// generated events).
pub type ClientId = u32;

/// What a client must implement to hear from the engine. All calls happen
/// on the post-process thread.
#[allow(unused_variables)]
pub trait ClientInterface: Send {
    /// Reply to the request with the given sequence number.
    fn response(&mut self, seq: i32, status: Status, subject: Option<&str>) {}
    fn put(&mut self, uri: &Uri, properties: &Properties) {}
    fn delta(&mut self, uri: &Uri, removed: &Properties, added: &Properties) {}
    fn deleted(&mut self, uri: &Uri) {}
    fn moved(&mut self, old_path: &Path, new_path: &Path) {}
    fn connected(&mut self, tail: &Path, head: &Path) {}
    fn disconnected(&mut self, tail: &Path, head: &Path) {}
    fn property_changed(&mut self, subject: &Uri, key: &Uri, value: &Atom) {}
    /// Control-port value monitoring.
    fn port_value(&mut self, path: &Path, value: f32) {}
    fn error(&mut self, message: &str) {}
    fn bundle_begin(&mut self) {}
    fn bundle_end(&mut self) {}
}

/// Holds the subscriber list and fans notifications out, bracketing
/// bundles with delimiters.
pub struct Broadcaster {
    clients: Mutex<Vec<(ClientId, Box<dyn ClientInterface>)>>,
    next_id: Mutex<ClientId>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        }
    }

    pub fn register(&self, client: Box<dyn ClientInterface>) -> ClientId {
        let mut next = self.next_id.lock().expect("broadcaster id lock");
        let id = *next;
        *next += 1;
        self.clients
            .lock()
            .expect("broadcaster client lock")
            .push((id, client));
        id
    }

    pub fn unregister(&self, id: ClientId) {
        self.clients
            .lock()
            .expect("broadcaster client lock")
            .retain(|(cid, _)| *cid != id);
    }

    pub fn num_clients(&self) -> usize {
        self.clients.lock().expect("broadcaster client lock").len()
    }

    /// Send to every subscribed client.
    pub fn send_all(&self, mut f: impl FnMut(&mut dyn ClientInterface)) {
        for (_, client) in self
            .clients
            .lock()
            .expect("broadcaster client lock")
            .iter_mut()
        {
            f(client.as_mut());
        }
    }

    /// Send to one client (responses go only to the requester).
    pub fn send_to(&self, id: ClientId, mut f: impl FnMut(&mut dyn ClientInterface)) {
        if let Some((_, client)) = self
            .clients
            .lock()
            .expect("broadcaster client lock")
            .iter_mut()
            .find(|(cid, _)| *cid == id)
        {
            f(client.as_mut());
        }
    }

    pub fn bundle_begin(&self) {
        self.send_all(|c| c.bundle_begin());
    }

    pub fn bundle_end(&self) {
        self.send_all(|c| c.bundle_end());
    }
}
