use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::engine::SlotKey;
use crate::limits::MAX_OPS_PER_TRANSACTION;
use crate::model::*;
use crate::wal::Wal;

use super::{CommitSummary, DocumentStore, MetaDecision, MetaUpdate, SlotFilter, StoreError, TxnOp};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// Queue `event` on a reserved channel slot. Never suspends, so a caller
/// that applies the same change to memory right before this call cannot be
/// cancelled between the two.
fn enqueue(
    permit: Option<mpsc::Permit<'_, WalCommand>>,
    event: Event,
) -> Option<oneshot::Receiver<io::Result<()>>> {
    let permit = permit?;
    let (tx, rx) = oneshot::channel();
    permit.send(WalCommand::Append { event, response: tx });
    Some(rx)
}

/// Wait for the group commit that carries an enqueued event.
async fn flushed(ack: Option<oneshot::Receiver<io::Result<()>>>) -> Result<(), StoreError> {
    let Some(rx) = ack else {
        return Ok(());
    };
    rx.await
        .map_err(|_| StoreError::Durability("WAL writer dropped response".into()))?
        .map_err(|e| StoreError::Durability(e.to_string()))
}

fn restore<K: Eq + Hash, V>(map: &DashMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

/// Reference `DocumentStore`: in-memory tables, optionally made durable by
/// a write-ahead log.
///
/// A mutation reaches memory and the WAL channel in one step with no await
/// point between them, so a caller dropped mid-call (a timed-out `bounded`)
/// leaves memory and the replayed log in agreement. The change is undone if
/// its flush reports an error.
pub struct MemoryStore {
    rooms: DashMap<String, Room>,
    slots: RwLock<BTreeMap<SlotKey, Slot>>,
    reservations: DashMap<Ulid, Reservation>,
    templates: DashMap<Ulid, RecurringTemplate>,
    snapshot_meta: DashMap<MonthId, SnapshotMeta>,
    /// Serializes document writes with their WAL append.
    doc_lock: Mutex<()>,
    /// Serializes snapshot-metadata read-modify-writes.
    meta_lock: Mutex<()>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    max_ops: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store; nothing survives a restart.
    pub fn new() -> Self {
        Self::with_max_ops(MAX_OPS_PER_TRANSACTION)
    }

    pub fn with_max_ops(max_ops: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            slots: RwLock::new(BTreeMap::new()),
            reservations: DashMap::new(),
            templates: DashMap::new(),
            snapshot_meta: DashMap::new(),
            doc_lock: Mutex::new(()),
            meta_lock: Mutex::new(()),
            wal_tx: None,
            max_ops: max_ops.max(1),
        }
    }

    /// Durable store backed by the WAL at `path`, replaying whatever it holds.
    /// Must be called inside a tokio runtime (spawns the WAL writer).
    pub fn open(path: &Path, max_ops: usize) -> io::Result<Self> {
        let (wal, events) = Wal::recover(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut store = Self::with_max_ops(max_ops);
        let mut slots = BTreeMap::new();
        for event in events {
            store.replay_event(&mut slots, event);
        }
        debug!(
            "replayed WAL {}: {} slots, {} reservations, {} templates",
            path.display(),
            slots.len(),
            store.reservations.len(),
            store.templates.len()
        );
        store.slots = RwLock::new(slots);
        store.wal_tx = Some(wal_tx);
        Ok(store)
    }

    fn replay_event(&self, slots: &mut BTreeMap<SlotKey, Slot>, event: Event) {
        match event {
            Event::RoomRegistered(room) => {
                self.rooms.insert(room.id.clone(), room);
            }
            Event::SlotsCommitted { puts, deletes } => {
                for key in deletes {
                    slots.remove(&key);
                }
                for slot in puts {
                    slots.insert(slot.key.clone(), slot);
                }
            }
            Event::ReservationSaved(r) => {
                self.reservations.insert(r.id, r);
            }
            Event::ReservationDeleted { id } => {
                self.reservations.remove(&id);
            }
            Event::TemplateSaved(t) => {
                self.templates.insert(t.id, t);
            }
            Event::TemplateDeleted { id } => {
                self.templates.remove(&id);
            }
            Event::SnapshotClaimed(meta) => {
                self.snapshot_meta.insert(meta.month, meta);
            }
        }
    }

    /// Reserve capacity on the WAL channel. Dropping the future or the permit
    /// queues nothing. `None` for volatile stores.
    async fn wal_permit(&self) -> Result<Option<mpsc::Permit<'_, WalCommand>>, StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(None);
        };
        let permit = wal_tx
            .reserve()
            .await
            .map_err(|_| StoreError::Durability("WAL writer shut down".into()))?;
        Ok(Some(permit))
    }

    /// Set or clear `key` in a document table and log `event` for it.
    /// Returns the previous value.
    async fn write_doc<K, V>(
        &self,
        map: &DashMap<K, V>,
        key: K,
        value: Option<V>,
        event: Event,
    ) -> Result<Option<V>, StoreError>
    where
        K: Eq + Hash + Clone,
    {
        let permit = self.wal_permit().await?;
        let previous = match value {
            Some(v) => map.insert(key.clone(), v),
            None => map.remove(&key).map(|(_, v)| v),
        };
        let ack = enqueue(permit, event);
        if let Err(e) = flushed(ack).await {
            restore(map, key, previous);
            return Err(e);
        }
        Ok(previous)
    }

    pub async fn slot_count(&self) -> usize {
        self.slots.read().await.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        // Hold every writer lock so no append can interleave with the rewrite.
        let _docs = self.doc_lock.lock().await;
        let _meta = self.meta_lock.lock().await;
        let slots = self.slots.read().await;

        let mut events: Vec<Event> = Vec::new();
        events.extend(self.rooms.iter().map(|e| Event::RoomRegistered(e.value().clone())));
        events.extend(self.reservations.iter().map(|e| Event::ReservationSaved(e.value().clone())));
        events.extend(self.templates.iter().map(|e| Event::TemplateSaved(e.value().clone())));
        events.extend(self.snapshot_meta.iter().map(|e| Event::SnapshotClaimed(*e.value())));
        let all: Vec<Slot> = slots.values().cloned().collect();
        for chunk in all.chunks(self.max_ops) {
            events.push(Event::SlotsCommitted { puts: chunk.to_vec(), deletes: Vec::new() });
        }

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Durability("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Durability("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Durability(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Compact once more than `threshold` appends accumulated. Returns whether it ran.
    pub async fn compact_if_needed(&self, threshold: u64) -> Result<bool, StoreError> {
        if self.wal_appends_since_compact().await <= threshold {
            return Ok(false);
        }
        self.compact().await?;
        Ok(true)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn max_ops_per_transaction(&self) -> usize {
        self.max_ops
    }

    async fn put_room(&self, room: Room) -> Result<(), StoreError> {
        let _guard = self.doc_lock.lock().await;
        let id = room.id.clone();
        self.write_doc(&self.rooms, id, Some(room.clone()), Event::RoomRegistered(room))
            .await?;
        Ok(())
    }

    async fn get_room(&self, id: &str) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.get(id).map(|e| e.value().clone()))
    }

    async fn get_slot(&self, key: &SlotKey) -> Result<Option<Slot>, StoreError> {
        Ok(self.slots.read().await.get(key).cloned())
    }

    async fn put_slot(&self, slot: Slot) -> Result<bool, StoreError> {
        let summary = self.commit(&[TxnOp::Put(slot)]).await?;
        Ok(summary.applied == 1)
    }

    async fn delete_slot(&self, key: &SlotKey) -> Result<Option<Slot>, StoreError> {
        let mut slots = self.slots.write().await;
        if !slots.contains_key(key) {
            return Ok(None);
        }
        let permit = self.wal_permit().await?;
        let removed = slots.remove(key);
        let ack = enqueue(permit, Event::SlotsCommitted { puts: Vec::new(), deletes: vec![key.clone()] });
        if let Err(e) = flushed(ack).await {
            if let Some(slot) = removed {
                slots.insert(key.clone(), slot);
            }
            return Err(e);
        }
        Ok(removed)
    }

    async fn query_slots(&self, filter: &SlotFilter) -> Result<Vec<Slot>, StoreError> {
        let slots = self.slots.read().await;
        let hits = match &filter.room_id {
            // Keys are room-prefixed, so a room filter is a range scan.
            Some(room) => {
                let start = SlotKey::room_prefix(room);
                let prefix = start.as_str().to_string();
                slots
                    .range(start..)
                    .take_while(|(k, _)| k.as_str().starts_with(&prefix))
                    .map(|(_, s)| s)
                    .filter(|s| filter.matches(s))
                    .cloned()
                    .collect()
            }
            None => slots.values().filter(|s| filter.matches(s)).cloned().collect(),
        };
        Ok(hits)
    }

    async fn commit(&self, ops: &[TxnOp]) -> Result<CommitSummary, StoreError> {
        if ops.len() > self.max_ops {
            return Err(StoreError::TransactionTooLarge { ops: ops.len(), max: self.max_ops });
        }
        let mut slots = self.slots.write().await;

        // Stage against an overlay so the transaction sees its own writes
        // (delete-then-create on one key) without touching live state.
        let mut staged: HashMap<SlotKey, Option<Slot>> = HashMap::new();
        let mut summary = CommitSummary::default();
        for op in ops {
            let key = op.key();
            let current = match staged.get(key) {
                Some(s) => s.clone(),
                None => slots.get(key).cloned(),
            };
            match op {
                TxnOp::Put(slot) => match current {
                    Some(cur) if cur.occupant == slot.occupant => summary.unchanged += 1,
                    Some(cur) => {
                        return Err(StoreError::AlreadyOccupied {
                            key: key.clone(),
                            existing: cur.occupant,
                        });
                    }
                    None => {
                        staged.insert(key.clone(), Some(slot.clone()));
                        summary.applied += 1;
                    }
                },
                TxnOp::Delete { expected, .. } => match current {
                    Some(cur) if cur.occupant == *expected => {
                        staged.insert(key.clone(), None);
                        summary.applied += 1;
                    }
                    Some(cur) => {
                        debug!("delete of {key} skipped: now held by {}", cur.occupant);
                        summary.unchanged += 1;
                    }
                    None => summary.unchanged += 1,
                },
            }
        }

        if summary.applied == 0 {
            return Ok(summary);
        }

        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for (key, slot) in &staged {
            match slot {
                Some(slot) => puts.push(slot.clone()),
                None => deletes.push(key.clone()),
            }
        }

        let permit = self.wal_permit().await?;
        let mut undo = Vec::with_capacity(staged.len());
        for (key, slot) in staged {
            let previous = match slot {
                Some(slot) => slots.insert(key.clone(), slot),
                None => slots.remove(&key),
            };
            undo.push((key, previous));
        }
        let ack = enqueue(permit, Event::SlotsCommitted { puts, deletes });
        if let Err(e) = flushed(ack).await {
            for (key, previous) in undo {
                match previous {
                    Some(slot) => slots.insert(key, slot),
                    None => slots.remove(&key),
                };
            }
            return Err(e);
        }
        Ok(summary)
    }

    async fn put_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        let _guard = self.doc_lock.lock().await;
        let id = reservation.id;
        self.write_doc(&self.reservations, id, Some(reservation.clone()), Event::ReservationSaved(reservation))
            .await?;
        Ok(())
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.reservations.get(&id).map(|e| e.value().clone()))
    }

    async fn delete_reservation(&self, id: Ulid) -> Result<bool, StoreError> {
        let _guard = self.doc_lock.lock().await;
        if !self.reservations.contains_key(&id) {
            return Ok(false);
        }
        let previous = self
            .write_doc(&self.reservations, id, None, Event::ReservationDeleted { id })
            .await?;
        Ok(previous.is_some())
    }

    async fn query_reservations_by_start(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut hits: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| e.value().start >= from && e.value().start <= to)
            .map(|e| e.value().clone())
            .collect();
        hits.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        Ok(hits)
    }

    async fn put_template(&self, template: RecurringTemplate) -> Result<(), StoreError> {
        let _guard = self.doc_lock.lock().await;
        let id = template.id;
        self.write_doc(&self.templates, id, Some(template.clone()), Event::TemplateSaved(template))
            .await?;
        Ok(())
    }

    async fn get_template(&self, id: Ulid) -> Result<Option<RecurringTemplate>, StoreError> {
        Ok(self.templates.get(&id).map(|e| e.value().clone()))
    }

    async fn delete_template(&self, id: Ulid) -> Result<bool, StoreError> {
        let _guard = self.doc_lock.lock().await;
        if !self.templates.contains_key(&id) {
            return Ok(false);
        }
        let previous = self
            .write_doc(&self.templates, id, None, Event::TemplateDeleted { id })
            .await?;
        Ok(previous.is_some())
    }

    async fn get_snapshot_meta(&self, month: MonthId) -> Result<Option<SnapshotMeta>, StoreError> {
        Ok(self.snapshot_meta.get(&month).map(|e| *e.value()))
    }

    async fn update_snapshot_meta(
        &self,
        month: MonthId,
        decide: MetaDecision,
    ) -> Result<MetaUpdate, StoreError> {
        let _guard = self.meta_lock.lock().await;
        let previous = self.snapshot_meta.get(&month).map(|e| *e.value());
        let written = decide(previous);
        if let Some(meta) = written {
            self.write_doc(&self.snapshot_meta, month, Some(meta), Event::SnapshotClaimed(meta))
                .await?;
        }
        Ok(MetaUpdate { previous, written })
    }
}
