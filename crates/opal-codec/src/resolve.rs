//! Graph resolution.
//!
//! Loads every object reachable from a root, depth-first, so the graph can
//! be traversed (or detached and handed to another thread) without further
//! store access.

use opal_common::Result;
use opal_core::{ObjRef, Persister, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Loads the full object graph reachable from `root`.
///
/// Every first-class object is materialized exactly once; cycles through
/// objects or shared cells terminate. With `disassociate`, each visited
/// object is detached from its persistence context after loading, leaving
/// a fully materialized standalone graph.
pub fn resolve(root: &ObjRef, persister: &dyn Persister, disassociate: bool) -> Result<()> {
    let mut walk = Walk {
        persister,
        disassociate,
        seen_objects: HashSet::new(),
        seen_cells: HashSet::new(),
        pending: vec![root.clone()],
    };
    let mut visited = 0usize;
    while let Some(obj) = walk.pending.pop() {
        if !walk.seen_objects.insert(Arc::as_ptr(&obj) as usize) {
            continue;
        }
        walk.persister.load_object(&obj)?;
        visited += 1;

        let fields = obj.read().field_values();
        for value in &fields {
            walk.value(value)?;
        }
        if walk.disassociate {
            obj.write().state_mut().attached = false;
        }
    }
    trace!(visited, disassociate, "resolved object graph");
    Ok(())
}

struct Walk<'a> {
    persister: &'a dyn Persister,
    disassociate: bool,
    seen_objects: HashSet<usize>,
    seen_cells: HashSet<usize>,
    pending: Vec<ObjRef>,
}

impl Walk<'_> {
    fn value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Object(obj) => self.pending.push(obj.clone()),
            Value::Shared(cell) => {
                if self.seen_cells.insert(Arc::as_ptr(cell) as usize) {
                    let inner = cell.read().clone();
                    self.value(&inner)?;
                }
            }
            Value::ObjArray { elems, .. } => {
                for e in elems {
                    self.value(e)?;
                }
            }
            Value::List(items) | Value::Set(items) => {
                for item in items {
                    self.value(item)?;
                }
            }
            Value::Map(entries) => {
                for (key, val) in entries {
                    self.value(key)?;
                    self.value(val)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
