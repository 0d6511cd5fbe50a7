//! An in-process database with the same observable behaviour as the remote
//! backend: queries, listeners, priorities, server values and on-disconnect
//! operations. Backs the node and config-node tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::query::{ordered_children, query_value};
use super::{
    AuthMethod, ClientKind, DataSnapshot, Database, DatabaseError, ListenHandle, ListenerKind, OnDisconnectOp,
    SnapshotSink, WriteOp,
};
use crate::constraint::QueryOp;
use crate::payload::{Priority, SERVER_VALUE_KEY};

type Segments = Vec<String>;
type Events = Vec<(SnapshotSink, DataSnapshot)>;

struct Listener {
    id: u64,
    kind: ListenerKind,
    path: Segments,
    query: Vec<QueryOp>,
    sink: SnapshotSink,
    last_value: Value,
    last_children: Vec<(String, Value)>,
}

#[derive(Default)]
struct Inner {
    root: Value,
    priorities: HashMap<String, Priority>,
    listeners: Vec<Listener>,
    next_listener: u64,
    on_disconnect: Vec<(Segments, OnDisconnectOp)>,
    denied: Vec<Segments>,
    reject_auth: Option<String>,
    fail_next: Option<DatabaseError>,
    signed_in: bool,
    online: bool,
    closed: bool,
    push_seq: u64,
}

pub struct MemoryDatabase {
    kind: ClientKind,
    inner: Arc<Mutex<Inner>>,
    connection: broadcast::Sender<bool>,
    listen_calls: Arc<AtomicUsize>,
    cancel_calls: Arc<AtomicUsize>,
}

impl MemoryDatabase {
    pub fn new(kind: ClientKind) -> Arc<Self> {
        let (connection, _) = broadcast::channel(16);
        Arc::new(Self {
            kind,
            inner: Arc::new(Mutex::new(Inner::default())),
            connection,
            listen_calls: Arc::new(AtomicUsize::new(0)),
            cancel_calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, DatabaseError> {
        self.inner.lock().map_err(|_| DatabaseError::Other("database state poisoned".into()))
    }

    /// Seeds data at a path without any checks.
    pub fn seed(&self, path: &str, value: Value) {
        if let Ok(mut inner) = self.lock() {
            write_at(&mut inner.root, &segments(Some(path)), prune(value));
            let events = inner.collect_events();
            drop(inner);
            dispatch(events);
        }
    }

    pub fn value_at(&self, path: &str) -> Value {
        self.lock()
            .map(|inner| value_at(&inner.root, &segments(Some(path))).clone())
            .unwrap_or(Value::Null)
    }

    pub fn priority_at(&self, path: &str) -> Option<Priority> {
        self.lock().ok()?.priorities.get(&segments(Some(path)).join("/")).cloned()
    }

    /// Any access at or below `path` fails with permission denied.
    pub fn deny(&self, path: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.denied.push(segments(Some(path)));
        }
    }

    pub fn reject_auth(&self, reason: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.reject_auth = Some(reason.to_string());
        }
    }

    /// The next read or write fails with `err`.
    pub fn fail_next(&self, err: DatabaseError) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_next = Some(err);
        }
    }

    pub fn is_signed_in(&self) -> bool {
        self.lock().map(|i| i.signed_in).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|i| i.closed).unwrap_or(true)
    }

    pub fn listen_calls(&self) -> usize {
        self.listen_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.lock().map(|i| i.listeners.len()).unwrap_or(0)
    }

    pub fn pending_on_disconnect(&self) -> usize {
        self.lock().map(|i| i.on_disconnect.len()).unwrap_or(0)
    }

    /// Simulates the connection going up or down. Going down runs the
    /// queued on-disconnect operations, as the server does.
    pub fn set_online(&self, online: bool) {
        let Ok(mut inner) = self.lock() else { return };
        if inner.online == online {
            return;
        }
        inner.online = online;
        let events = if online { vec![] } else { inner.run_on_disconnect() };
        drop(inner);
        dispatch(events);
        debug!(online, "memory database connection changed");
        let _ = self.connection.send(online);
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn kind(&self) -> ClientKind {
        self.kind
    }

    async fn sign_in(&self, auth: &AuthMethod) -> Result<(), DatabaseError> {
        {
            let mut inner = self.lock()?;
            if inner.closed {
                return Err(DatabaseError::Closed);
            }
            if let Some(reason) = &inner.reject_auth {
                return Err(DatabaseError::Auth(reason.clone()));
            }
            inner.signed_in = true;
        }
        info!(method = auth.name(), "signed in to memory database");
        self.set_online(true);
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), DatabaseError> {
        self.lock()?.signed_in = false;
        Ok(())
    }

    fn connection(&self) -> broadcast::Receiver<bool> {
        self.connection.subscribe()
    }

    async fn get(&self, path: Option<&str>, query: &[QueryOp]) -> Result<DataSnapshot, DatabaseError> {
        let segs = segments(path);
        let mut inner = self.lock()?;
        inner.check(&segs)?;
        Ok(inner.snapshot(&segs, query))
    }

    fn listen(
        &self,
        listener: ListenerKind,
        path: Option<&str>,
        query: &[QueryOp],
        sink: SnapshotSink,
    ) -> Result<ListenHandle, DatabaseError> {
        let segs = segments(path);
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(DatabaseError::Closed);
        }
        if inner.is_denied(&segs) {
            return Err(DatabaseError::PermissionDenied(segs.join("/")));
        }
        self.listen_calls.fetch_add(1, Ordering::SeqCst);

        let id = inner.next_listener;
        inner.next_listener += 1;
        let base = value_at(&inner.root, &segs).clone();
        let last_value = query_value(&base, query, &inner.priority_lookup(&segs));
        let last_children = ordered_children(&base, query, &inner.priority_lookup(&segs));

        let mut initial: Events = vec![];
        match listener {
            ListenerKind::Value => initial.push((sink.clone(), inner.snapshot(&segs, query))),
            ListenerKind::ChildAdded => {
                for (i, (key, value)) in last_children.iter().enumerate() {
                    let snapshot = inner.child_snapshot(&segs, key, value, previous_key(&last_children, i));
                    initial.push((sink.clone(), snapshot));
                }
            }
            _ => {}
        }

        inner.listeners.push(Listener {
            id,
            kind: listener,
            path: segs,
            query: query.to_vec(),
            sink,
            last_value,
            last_children,
        });
        drop(inner);
        dispatch(initial);

        let state = self.inner.clone();
        let cancels = self.cancel_calls.clone();
        Ok(ListenHandle::new(move || {
            cancels.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut inner) = state.lock() {
                inner.listeners.retain(|l| l.id != id);
            }
        }))
    }

    async fn write(&self, path: Option<&str>, op: WriteOp) -> Result<Option<String>, DatabaseError> {
        let mut segs = segments(path);
        let mut inner = self.lock()?;
        inner.check(&segs)?;
        let now = chrono::Utc::now().timestamp_millis();

        let mut pushed = None;
        match op {
            WriteOp::Set(value) => inner.set(&segs, value, None, now),
            WriteOp::Push(value) => {
                let key = inner.push_key(now);
                segs.push(key.clone());
                inner.set(&segs, value, None, now);
                pushed = Some(key);
            }
            WriteOp::Update(map) => inner.update(&segs, map, now),
            WriteOp::Remove => inner.set(&segs, Value::Null, None, now),
            WriteOp::SetPriority(priority) => inner.set_priority(&segs, priority),
            WriteOp::SetWithPriority(value, priority) => inner.set(&segs, value, priority, now),
        }

        let events = inner.collect_events();
        drop(inner);
        dispatch(events);
        Ok(pushed)
    }

    async fn on_disconnect(&self, path: Option<&str>, op: OnDisconnectOp) -> Result<(), DatabaseError> {
        let segs = segments(path);
        let mut inner = self.lock()?;
        inner.check(&segs)?;
        match op {
            OnDisconnectOp::Cancel => inner.on_disconnect.retain(|(p, _)| !p.starts_with(&segs)),
            op => inner.on_disconnect.push((segs, op)),
        }
        Ok(())
    }

    async fn dispose(&self) {
        let Ok(mut inner) = self.lock() else { return };
        if inner.closed {
            return;
        }
        let events = inner.run_on_disconnect();
        inner.closed = true;
        inner.signed_in = false;
        inner.online = false;
        inner.listeners.clear();
        drop(inner);
        dispatch(events);
        let _ = self.connection.send(false);
    }
}

impl Inner {
    fn is_denied(&self, segs: &[String]) -> bool {
        self.denied.iter().any(|d| segs.starts_with(d))
    }

    fn check(&mut self, segs: &[String]) -> Result<(), DatabaseError> {
        if self.closed {
            return Err(DatabaseError::Closed);
        }
        if let Some(err) = self.fail_next.take() {
            return Err(err);
        }
        if self.is_denied(segs) {
            return Err(DatabaseError::PermissionDenied(segs.join("/")));
        }
        Ok(())
    }

    fn priority_lookup<'a>(&'a self, base: &[String]) -> impl Fn(&str) -> Option<Priority> + use<'a> {
        let base = base.join("/");
        move |key: &str| {
            let full = if base.is_empty() { key.to_string() } else { format!("{base}/{key}") };
            self.priorities.get(&full).cloned()
        }
    }

    fn snapshot(&self, segs: &[String], query: &[QueryOp]) -> DataSnapshot {
        let base = value_at(&self.root, segs);
        DataSnapshot {
            key: segs.last().cloned(),
            value: query_value(base, query, &self.priority_lookup(segs)),
            priority: self.priorities.get(&segs.join("/")).cloned(),
            previous_child_name: None,
        }
    }

    fn child_snapshot(&self, segs: &[String], key: &str, value: &Value, previous: Option<String>) -> DataSnapshot {
        let mut full = segs.to_vec();
        full.push(key.to_string());
        DataSnapshot {
            key: Some(key.to_string()),
            value: value.clone(),
            priority: self.priorities.get(&full.join("/")).cloned(),
            previous_child_name: previous,
        }
    }

    fn push_key(&mut self, now: i64) -> String {
        self.push_seq += 1;
        format!("-{:012x}{:07x}", now, self.push_seq)
    }

    fn clear_priorities(&mut self, segs: &[String]) {
        let prefix = segs.join("/");
        self.priorities
            .retain(|k, _| !(prefix.is_empty() || *k == prefix || k.starts_with(&format!("{prefix}/"))));
    }

    fn set(&mut self, segs: &[String], value: Value, priority: Option<Priority>, now: i64) {
        let current = value_at(&self.root, segs).clone();
        let resolved = prune(resolve_server_values(value, &current, now));
        self.clear_priorities(segs);
        write_at(&mut self.root, segs, resolved);
        self.set_priority(segs, priority);
    }

    fn update(&mut self, segs: &[String], map: Map<String, Value>, now: i64) {
        for (key, value) in map {
            let mut child = segs.to_vec();
            child.extend(key.split('/').filter(|s| !s.is_empty()).map(str::to_string));
            self.set(&child, value, None, now);
        }
    }

    fn set_priority(&mut self, segs: &[String], priority: Option<Priority>) {
        let key = segs.join("/");
        match priority {
            Some(p) => {
                self.priorities.insert(key, p);
            }
            None => {
                self.priorities.remove(&key);
            }
        }
    }

    fn run_on_disconnect(&mut self) -> Events {
        let now = chrono::Utc::now().timestamp_millis();
        for (segs, op) in std::mem::take(&mut self.on_disconnect) {
            match op {
                OnDisconnectOp::Set(value) => self.set(&segs, value, None, now),
                OnDisconnectOp::SetWithPriority(value, priority) => self.set(&segs, value, priority, now),
                OnDisconnectOp::Update(map) => self.update(&segs, map, now),
                OnDisconnectOp::Remove => self.set(&segs, Value::Null, None, now),
                OnDisconnectOp::Cancel => {}
            }
        }
        self.collect_events()
    }

    /// Diffs every listener's view against what it saw last.
    fn collect_events(&mut self) -> Events {
        let mut events = vec![];
        let mut listeners = std::mem::take(&mut self.listeners);
        for l in listeners.iter_mut() {
            let base = value_at(&self.root, &l.path).clone();
            let lookup = self.priority_lookup(&l.path);
            match l.kind {
                ListenerKind::Value => {
                    let now = query_value(&base, &l.query, &lookup);
                    if now != l.last_value {
                        let mut snapshot = self.snapshot(&l.path, &l.query);
                        snapshot.value = now.clone();
                        events.push((l.sink.clone(), snapshot));
                        l.last_value = now;
                    }
                }
                kind => {
                    let now = ordered_children(&base, &l.query, &lookup);
                    for (key, value, previous) in diff_children(kind, &l.last_children, &now) {
                        events.push((l.sink.clone(), self.child_snapshot(&l.path, &key, &value, previous)));
                    }
                    l.last_children = now;
                }
            }
        }
        self.listeners = listeners;
        events
    }
}

fn dispatch(events: Events) {
    for (sink, snapshot) in events {
        sink(snapshot);
    }
}

fn previous_key(children: &[(String, Value)], index: usize) -> Option<String> {
    index.checked_sub(1).and_then(|i| children.get(i)).map(|(k, _)| k.clone())
}

fn diff_children(
    kind: ListenerKind,
    old: &[(String, Value)],
    new: &[(String, Value)],
) -> Vec<(String, Value, Option<String>)> {
    let old_map: HashMap<&str, &Value> = old.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let new_map: HashMap<&str, &Value> = new.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let mut out = vec![];
    match kind {
        ListenerKind::ChildAdded => {
            for (i, (k, v)) in new.iter().enumerate() {
                if !old_map.contains_key(k.as_str()) {
                    out.push((k.clone(), v.clone(), previous_key(new, i)));
                }
            }
        }
        ListenerKind::ChildRemoved => {
            for (k, v) in old {
                if !new_map.contains_key(k.as_str()) {
                    out.push((k.clone(), v.clone(), None));
                }
            }
        }
        ListenerKind::ChildChanged => {
            for (i, (k, v)) in new.iter().enumerate() {
                if old_map.get(k.as_str()).is_some_and(|old| *old != v) {
                    out.push((k.clone(), v.clone(), previous_key(new, i)));
                }
            }
        }
        ListenerKind::ChildMoved => {
            let old_common: Vec<&str> = old.iter().map(|(k, _)| k.as_str()).filter(|k| new_map.contains_key(k)).collect();
            let new_common: Vec<&str> = new.iter().map(|(k, _)| k.as_str()).filter(|k| old_map.contains_key(k)).collect();
            let old_pred: HashMap<&str, Option<&str>> = old_common
                .iter()
                .enumerate()
                .map(|(i, k)| (*k, i.checked_sub(1).map(|p| old_common[p])))
                .collect();
            for (j, k) in new_common.iter().enumerate() {
                let pred = j.checked_sub(1).map(|p| new_common[p]);
                let changed = old_map.get(k) != new_map.get(k);
                if changed && old_pred.get(k).copied().flatten() != pred {
                    if let Some(i) = new.iter().position(|(key, _)| key == k) {
                        out.push((k.to_string(), new[i].1.clone(), previous_key(new, i)));
                    }
                }
            }
        }
        ListenerKind::Value => {}
    }
    out
}

fn segments(path: Option<&str>) -> Segments {
    path.unwrap_or_default()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn value_at<'a>(root: &'a Value, segs: &[String]) -> &'a Value {
    static NULL: Value = Value::Null;
    segs.iter()
        .try_fold(root, |v, seg| match v {
            Value::Object(map) => map.get(seg.as_str()),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
        .unwrap_or(&NULL)
}

/// Writes `value` at `segs`, creating parents and dropping empty ones.
fn write_at(node: &mut Value, segs: &[String], value: Value) {
    let Some((first, rest)) = segs.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(first.clone()).or_insert(Value::Null);
        write_at(child, rest, value);
        if is_empty(child) {
            map.remove(first);
        }
        if map.is_empty() {
            *node = Value::Null;
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Drops null leaves and empty objects, as the backend never stores them.
fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !is_empty(v))
                .collect();
            if pruned.is_empty() { Value::Null } else { Value::Object(pruned) }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(prune).collect()),
        other => other,
    }
}

fn resolve_server_values(value: Value, current: &Value, now: i64) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                match map.get(SERVER_VALUE_KEY) {
                    Some(Value::String(s)) if s == "timestamp" => return Value::from(now),
                    Some(Value::Object(inc)) => {
                        if let Some(delta) = inc.get("increment").and_then(Value::as_f64) {
                            let base = current.as_f64().unwrap_or(0.0);
                            return crate::property::number_value(base + delta).unwrap_or(Value::Null);
                        }
                    }
                    _ => {}
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| {
                        let child = current.get(&k).cloned().unwrap_or(Value::Null);
                        (k, resolve_server_values(v, &child, now))
                    })
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| {
                    let child = current.get(i).cloned().unwrap_or(Value::Null);
                    resolve_server_values(v, &child, now)
                })
                .collect(),
        ),
        other => other,
    }
}
