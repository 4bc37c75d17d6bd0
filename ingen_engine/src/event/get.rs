//! Get: a recursive state snapshot sent to the requesting client.

use ingen_core::{Path, Properties, Status, Uri};

use crate::block::Block;
use crate::broadcaster::ClientId;
use crate::event::structure::describe_port;
use crate::event::{resolve, PostProcessContext, PreProcessContext};
use crate::store::ObjectRef;

pub struct Get {
    pub uri: Uri,
    snapshot: Vec<(Uri, Properties)>,
    arcs: Vec<(Path, Path)>,
}

impl Get {
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            snapshot: Vec::new(),
            arcs: Vec::new(),
        }
    }

    fn snapshot_block(&mut self, block: &Block) {
        self.snapshot.push(resolve::describe(block));
        for port in block.ports.iter() {
            self.snapshot
                .push((Uri::from_path(port.path()), describe_port(port)));
        }
        if let Some(graph) = block.graph() {
            for (_, child) in graph.blocks().iter() {
                self.snapshot_block(child);
            }
            for (tail, head) in graph.arcs.keys() {
                self.arcs.push((tail.clone(), head.clone()));
            }
        }
    }

    pub(crate) fn pre_process(&mut self, ctx: &mut PreProcessContext) -> Status {
        let Some(path) = self.uri.to_path() else {
            return Status::BadUri;
        };
        let store = ctx.store.lock().expect("store lock");
        match store.get(&path) {
            Ok(ObjectRef::Block(block)) => {
                // Safety: live block, store mutex held; the snapshot is
                // taken entirely within this lock.
                self.snapshot_block(unsafe { &*block });
                Status::Success
            }
            Ok(ObjectRef::Port(port)) => {
                // Safety: live port, store mutex held.
                let port = unsafe { &*port };
                self.snapshot
                    .push((Uri::from_path(port.path()), describe_port(port)));
                Status::Success
            }
            Err(status) => status,
        }
    }

    pub(crate) fn post_process(&mut self, ctx: &mut PostProcessContext, client: ClientId) {
        ctx.broadcaster.send_to(client, |c| {
            c.bundle_begin();
            for (uri, properties) in &self.snapshot {
                c.put(uri, properties);
            }
            for (tail, head) in &self.arcs {
                c.connected(tail, head);
            }
            c.bundle_end();
        });
    }
}
