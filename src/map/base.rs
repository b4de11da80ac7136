use crate::counter::Counter;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;
use std::marker::PhantomData;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::*;

// Value words are tagged pointers. A primed value has been carried into the
// successor chunk and is immutable in its own generation; a tombstone keeps
// the slot claimed after removal. The dead prime (both tags, null pointer)
// is the terminal state of a fully copied slot.
pub(crate) const PRIME_TAG: usize = 0b01;
pub(crate) const TOMB_TAG: usize = 0b10;

const REPROBE_BASE: usize = 8;
const COPY_CHUNK: usize = 32;
const MAX_CAP: usize = isize::MAX as usize;

#[repr(align(8))]
pub(crate) struct ValueCell<V>(pub(crate) V);

static_assertions::const_assert!(std::mem::align_of::<ValueCell<u8>>() >= 8);

#[inline(always)]
fn is_empty_val<V>(v: Shared<'_, ValueCell<V>>) -> bool {
    v.is_null() && v.tag() == 0
}

#[inline(always)]
fn is_prime<V>(v: Shared<'_, ValueCell<V>>) -> bool {
    v.tag() & PRIME_TAG != 0
}

#[inline(always)]
fn is_live<V>(v: Shared<'_, ValueCell<V>>) -> bool {
    !v.is_null() && v.tag() == 0
}

#[inline(always)]
fn dead_prime<'g, V>() -> Shared<'g, ValueCell<V>> {
    Shared::null().with_tag(TOMB_TAG | PRIME_TAG)
}

#[inline(always)]
fn occupation_limit(cap: usize) -> usize {
    (cap as f64 * 0.8f64) as usize
}

/// Outcome of probing a key cell.
pub enum KeyProbe {
    Empty,
    Match,
    Other,
}

/// Outcome of a claim attempt on a key cell.
pub enum Claim {
    /// This call transitioned the cell from empty to claimed.
    Claimed,
    /// The cell already holds an equal key; the claim is idempotent.
    Held,
    /// The cell holds a different key, probe the next slot.
    Collision,
}

/// The specialization boundary: how one key representation is stored in a
/// slot, claimed, compared and read back. The dictionary core is generic over
/// this trait, so the key layout is chosen at the type level.
pub trait KeySpace<K>: Send + Sync {
    type Cell: Send + Sync;

    fn empty_cell(&self) -> Self::Cell;
    fn hash_of(&self, key: &K) -> usize;
    fn probe(&self, cell: &Self::Cell, key: &K, hash: usize, guard: &Guard) -> KeyProbe;
    fn try_claim_for_put(&self, cell: &Self::Cell, key: &K, hash: usize, guard: &Guard) -> Claim;
    /// Same claim discipline, invoked by the resize engine while replaying an
    /// entry into the successor chunk. Must not touch the live-size count.
    fn try_claim_for_copy(&self, cell: &Self::Cell, key: &K, hash: usize, guard: &Guard)
        -> Claim;
    fn read_key(&self, cell: &Self::Cell, guard: &Guard) -> Option<K>;
    /// Free whatever the cell owns. Only sound with exclusive access to the
    /// chunk, i.e. from `Chunk::drop`.
    unsafe fn release_cell(cell: &Self::Cell);
}

pub(crate) struct Slot<C, V> {
    key: C,
    value: Atomic<ValueCell<V>>,
}

/// One table generation: a fixed slot array plus the accounting that drives
/// resize and the cursors that coordinate the cooperative copy.
pub(crate) struct Chunk<K, V, S: KeySpace<K>> {
    cap_mask: usize,
    slots: Box<[Slot<S::Cell, V>]>,
    // Claimed slots, tombstones included. Striped because every insert on
    // every thread bumps it; the estimate is the resize watermark.
    used: Counter,
    dead: AtomicUsize,
    copy_idx: AtomicUsize,
    copy_done: AtomicUsize,
    // Published exactly once; the generation is superseded from that moment.
    next: Atomic<Chunk<K, V, S>>,
    _marker: PhantomData<K>,
}

impl<K, V, S: KeySpace<K>> Chunk<K, V, S> {
    fn new(cap: usize, space: &S) -> Self {
        debug_assert!(cap.is_power_of_two());
        let slots = (0..cap)
            .map(|_| Slot {
                key: space.empty_cell(),
                value: Atomic::null(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            cap_mask: cap - 1,
            slots,
            used: Counter::new(),
            dead: AtomicUsize::new(0),
            copy_idx: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
            next: Atomic::null(),
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    fn cap(&self) -> usize {
        self.cap_mask + 1
    }

    #[inline(always)]
    fn slot(&self, idx: usize) -> &Slot<S::Cell, V> {
        &self.slots[idx & self.cap_mask]
    }

    #[inline(always)]
    fn reprobe_limit(&self) -> usize {
        (REPROBE_BASE + (self.cap() >> 4)).min(self.cap())
    }

    #[inline(always)]
    fn crowded(&self) -> bool {
        self.used.estimated().max(0) as usize >= occupation_limit(self.cap())
    }
}

impl<K, V, S: KeySpace<K>> Drop for Chunk<K, V, S> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            for slot in self.slots.iter() {
                S::release_cell(&slot.key);
                let v = slot.value.load(Relaxed, guard);
                if !v.is_null() {
                    // Live and primed payloads are owned by this generation;
                    // copies into the successor are separate clones.
                    drop(v.with_tag(0).into_owned());
                }
            }
        }
    }
}

/// How the current value must look for `put_if_match` to install the new one.
pub(crate) enum MatchOp<'a, V> {
    /// Unconditional.
    Any,
    /// Empty or tombstone, for add-if-absent.
    AbsentOnly,
    /// Present and live, for remove and plain update.
    PresentOnly,
    /// Present and accepted by the predicate, for compare-and-swap updates.
    If(&'a dyn Fn(&V) -> bool),
}

pub(crate) enum PutResult<V> {
    /// Installed; the key was absent before.
    Added,
    /// Installed over this live value.
    Replaced(V),
    /// Not installed; add-if-absent found this live value.
    Existed(V),
    /// Not installed; nothing live to update or remove.
    NotFound,
    /// Not installed; the predicate rejected this live value.
    Refused(V),
}

/// The dictionary core: owns the generation chain and the equality/hash
/// space, and drives lookup, mutation and the cooperative migration.
pub struct Table<K, V, S: KeySpace<K>> {
    chunk: Atomic<Chunk<K, V, S>>,
    space: S,
    size: Counter,
}

impl<K: Clone, V: Clone, S: KeySpace<K>> Table<K, V, S> {
    pub(crate) fn with_capacity(cap: usize, space: S) -> Self {
        let cap = cap.next_power_of_two();
        assert!(cap <= MAX_CAP, "table capacity out of range");
        let chunk = Chunk::new(cap, &space);
        Self {
            chunk: Atomic::new(chunk),
            space,
            size: Counter::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.size.sum().max(0) as usize
    }

    pub(crate) fn estimated_len(&self) -> usize {
        self.size.estimated().max(0) as usize
    }

    pub(crate) fn insert(&self, key: &K, value: &V) -> Option<V> {
        match self.put_if_match(key, Some(value), MatchOp::Any) {
            PutResult::Added => None,
            PutResult::Replaced(prev) => Some(prev),
            _ => unreachable!("unconditional insert cannot be refused"),
        }
    }

    pub(crate) fn try_insert(&self, key: &K, value: &V) -> Option<V> {
        match self.put_if_match(key, Some(value), MatchOp::AbsentOnly) {
            PutResult::Added => None,
            PutResult::Existed(current) => Some(current),
            _ => unreachable!("add-if-absent neither adds nor finds"),
        }
    }

    pub(crate) fn remove(&self, key: &K) -> Option<V> {
        match self.put_if_match(key, None, MatchOp::PresentOnly) {
            PutResult::Replaced(prev) => Some(prev),
            PutResult::NotFound => None,
            _ => unreachable!("remove neither replaces nor misses"),
        }
    }

    pub(crate) fn try_update(&self, key: &K, new: &V, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let pred = |current: &V| current == expected;
        matches!(
            self.put_if_match(key, Some(new), MatchOp::If(&pred)),
            PutResult::Replaced(_)
        )
    }

    pub(crate) fn upsert(&self, key: &K, value: &V) -> bool {
        matches!(
            self.put_if_match(key, Some(value), MatchOp::Any),
            PutResult::Added
        )
    }

    // Add-if-absent racing update-if-present until one atomic step wins.
    pub(crate) fn insert_or_update<F: Fn(&V) -> V>(&self, key: &K, add: &V, update: F) -> V
    where
        V: PartialEq,
    {
        let backoff = Backoff::new();
        loop {
            match self.get(key) {
                Some(current) => {
                    let new = update(&current);
                    let pred = |v: &V| v == &current;
                    if let PutResult::Replaced(_) =
                        self.put_if_match(key, Some(&new), MatchOp::If(&pred))
                    {
                        return new;
                    }
                }
                None => {
                    if let PutResult::Added =
                        self.put_if_match(key, Some(add), MatchOp::AbsentOnly)
                    {
                        return add.clone();
                    }
                }
            }
            backoff.spin();
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        let guard = epoch::pin();
        let hash = self.space.hash_of(key);
        let mut chunk = unsafe { self.chunk.load(Acquire, &guard).deref() };
        'chunk: loop {
            let limit = chunk.reprobe_limit();
            let mut idx = hash;
            let mut reprobes = 0;
            loop {
                let slot = chunk.slot(idx);
                match self.space.probe(&slot.key, key, hash, &guard) {
                    KeyProbe::Empty => return None,
                    KeyProbe::Match => {
                        let v = slot.value.load(Acquire, &guard);
                        if is_prime(v) {
                            // Migrated: contribute the copy, read on in the
                            // successor.
                            chunk = self.copy_slot_and_promote(chunk, idx, &guard);
                            continue 'chunk;
                        }
                        return if is_live(v) {
                            Some(unsafe { v.deref() }.0.clone())
                        } else {
                            None
                        };
                    }
                    KeyProbe::Other => {}
                }
                idx = idx.wrapping_add(1);
                reprobes += 1;
                if reprobes >= limit {
                    let next = chunk.next.load(Acquire, &guard);
                    if next.is_null() {
                        return None;
                    }
                    let next = unsafe { next.deref() };
                    self.help_copy(chunk, next, false, &guard);
                    chunk = next;
                    continue 'chunk;
                }
            }
        }
    }

    // The one mutation primitive. Locates or claims the key's slot, then
    // installs `value` (None is a tombstone) if the current value satisfies
    // `cond`. Contention never surfaces; mismatched attempts retry until the
    // condition itself settles the outcome.
    pub(crate) fn put_if_match(
        &self,
        key: &K,
        value: Option<&V>,
        cond: MatchOp<'_, V>,
    ) -> PutResult<V> {
        let guard = epoch::pin();
        let backoff = Backoff::new();
        let hash = self.space.hash_of(key);
        let inserts = value.is_some();
        // One allocation, reused across CAS retries and generations.
        let mut pending: Option<Owned<ValueCell<V>>> =
            value.map(|v| Owned::new(ValueCell(v.clone())));
        let mut chunk = unsafe { self.chunk.load(Acquire, &guard).deref() };
        'chunk: loop {
            let limit = chunk.reprobe_limit();
            let mut idx = hash;
            let mut reprobes = 0;
            // Find or claim the key's slot in this generation.
            let (slot, slot_idx) = loop {
                let slot = chunk.slot(idx);
                match self.space.probe(&slot.key, key, hash, &guard) {
                    KeyProbe::Match => break (slot, idx),
                    KeyProbe::Empty => {
                        if !inserts {
                            // Nothing to remove or update here, and a chain
                            // that still has an empty slot cannot have leaked
                            // this key into the successor.
                            return PutResult::NotFound;
                        }
                        match self.space.try_claim_for_put(&slot.key, key, hash, &guard) {
                            Claim::Claimed => {
                                chunk.used.incr(1);
                                break (slot, idx);
                            }
                            Claim::Held => break (slot, idx),
                            Claim::Collision => {}
                        }
                    }
                    KeyProbe::Other => {}
                }
                idx = idx.wrapping_add(1);
                reprobes += 1;
                if reprobes >= limit {
                    let next = if inserts {
                        self.ensure_next(chunk, &guard)
                    } else {
                        let next = chunk.next.load(Acquire, &guard);
                        if next.is_null() {
                            return PutResult::NotFound;
                        }
                        unsafe { next.deref() }
                    };
                    self.help_copy(chunk, next, false, &guard);
                    chunk = next;
                    continue 'chunk;
                }
            };
            // Install against the slot's current value.
            loop {
                let cur = slot.value.load(Acquire, &guard);
                if is_prime(cur) {
                    chunk = self.copy_slot_and_promote(chunk, slot_idx, &guard);
                    continue 'chunk;
                }
                // Once a successor exists no new value may land in this
                // generation; carry the slot forward and finish there.
                let next = chunk.next.load(Acquire, &guard);
                if !next.is_null() {
                    let next = unsafe { next.deref() };
                    if self.copy_slot(chunk, slot_idx, next, &guard) {
                        self.note_copied(chunk, 1, &guard);
                    }
                    self.help_copy(chunk, next, false, &guard);
                    chunk = next;
                    continue 'chunk;
                }
                let present = is_live(cur);
                if inserts && is_empty_val(cur) && chunk.crowded() {
                    // Claiming pressure: publish a successor and land there.
                    self.ensure_next(chunk, &guard);
                    continue;
                }
                match cond {
                    MatchOp::AbsentOnly if present => {
                        return PutResult::Existed(unsafe { cur.deref() }.0.clone());
                    }
                    MatchOp::PresentOnly | MatchOp::If(_) if !present => {
                        return PutResult::NotFound;
                    }
                    MatchOp::If(pred) => {
                        let current = unsafe { cur.deref() };
                        if !pred(&current.0) {
                            return PutResult::Refused(current.0.clone());
                        }
                    }
                    _ => {}
                }
                if !inserts && !present {
                    // Removing an absent entry leaves the slot untouched.
                    return PutResult::NotFound;
                }
                let installed = if let Some(owned) = pending.take() {
                    match slot.value.compare_exchange(cur, owned, AcqRel, Acquire, &guard) {
                        Ok(_) => true,
                        Err(e) => {
                            pending = Some(e.new);
                            false
                        }
                    }
                } else {
                    slot.value
                        .compare_exchange(
                            cur,
                            Shared::null().with_tag(TOMB_TAG),
                            AcqRel,
                            Acquire,
                            &guard,
                        )
                        .is_ok()
                };
                if installed {
                    return if present {
                        let prev = unsafe { cur.deref() }.0.clone();
                        unsafe { guard.defer_destroy(cur) };
                        if !inserts {
                            self.size.decr(1);
                            chunk.dead.fetch_add(1, Relaxed);
                        }
                        PutResult::Replaced(prev)
                    } else {
                        self.size.incr(1);
                        PutResult::Added
                    };
                }
                backoff.spin();
            }
        }
    }

    // Publish (or fetch) the successor of `chunk`. Exactly one allocation
    // wins; losers discard theirs and adopt the winner's.
    fn ensure_next<'g>(&self, chunk: &'g Chunk<K, V, S>, guard: &'g Guard) -> &'g Chunk<K, V, S> {
        let next = chunk.next.load(Acquire, guard);
        if !next.is_null() {
            return unsafe { next.deref() };
        }
        let cap = chunk.cap();
        let dead = chunk.dead.load(Relaxed);
        // Mostly tombstones: recopy at the same size to squeeze them out.
        let new_cap = if dead >= cap / 2 { cap } else { cap << 1 };
        assert!(new_cap <= MAX_CAP, "table capacity out of range");
        let fresh = Owned::new(Chunk::new(new_cap, &self.space));
        match chunk
            .next
            .compare_exchange(Shared::null(), fresh, AcqRel, Acquire, guard)
        {
            Ok(installed) => {
                trace!("resizing chunk, cap {} -> {}", cap, new_cap);
                unsafe { installed.deref() }
            }
            Err(e) => {
                drop(e.new);
                unsafe { e.current.deref() }
            }
        }
    }

    // Copy one slot forward and fold the work into the completion count.
    // Returns the successor so callers can retry there.
    fn copy_slot_and_promote<'g>(
        &self,
        chunk: &'g Chunk<K, V, S>,
        idx: usize,
        guard: &'g Guard,
    ) -> &'g Chunk<K, V, S> {
        let next = chunk.next.load(Acquire, guard);
        let next = match unsafe { next.as_ref() } {
            Some(next) => next,
            None => unreachable!("primed slot in a chunk without a successor"),
        };
        if self.copy_slot(chunk, idx, next, guard) {
            self.note_copied(chunk, 1, guard);
        }
        next
    }

    // Migrate the slot at `idx` into `new`. Returns true when this call
    // performed the decisive completion, which the caller must account.
    fn copy_slot(
        &self,
        old: &Chunk<K, V, S>,
        idx: usize,
        new: &Chunk<K, V, S>,
        guard: &Guard,
    ) -> bool {
        let slot = old.slot(idx);
        let backoff = Backoff::new();
        // Prime the value so no further writes can land in this generation.
        let mut cur = slot.value.load(Acquire, guard);
        loop {
            if is_prime(cur) {
                break;
            }
            if cur.is_null() {
                // Empty or tombstone: nothing to carry, retire in one step.
                match slot
                    .value
                    .compare_exchange(cur, dead_prime(), AcqRel, Acquire, guard)
                {
                    Ok(_) => return true,
                    Err(e) => {
                        cur = e.current;
                        backoff.spin();
                        continue;
                    }
                }
            }
            let primed = cur.with_tag(cur.tag() | PRIME_TAG);
            match slot.value.compare_exchange(cur, primed, AcqRel, Acquire, guard) {
                Ok(_) => {
                    cur = primed;
                    break;
                }
                Err(e) => {
                    cur = e.current;
                    backoff.spin();
                }
            }
        }
        if cur.is_null() {
            // Dead prime: another thread already finished this slot.
            return false;
        }
        // Replay the pair into the successor. The payload is cloned so every
        // generation exclusively owns the allocations its slots reach.
        let key = match self.space.read_key(&slot.key, guard) {
            Some(key) => key,
            None => unreachable!("valued slot with an unclaimed key"),
        };
        let value = unsafe { cur.with_tag(0).deref() }.0.clone();
        self.install_copy(new, &key, value, guard);
        // Retire the old slot. Exactly one thread wins this transition and
        // with it the ownership of the stale payload.
        match slot
            .value
            .compare_exchange(cur, dead_prime(), AcqRel, Acquire, guard)
        {
            Ok(_) => {
                unsafe { guard.defer_destroy(cur.with_tag(0)) };
                true
            }
            Err(_) => false,
        }
    }

    // Write a migrated pair into the successor chunk, never over anything
    // fresher than an untouched empty slot.
    fn install_copy<'g>(
        &self,
        mut chunk: &'g Chunk<K, V, S>,
        key: &K,
        value: V,
        guard: &'g Guard,
    ) {
        let hash = self.space.hash_of(key);
        let mut pending = Owned::new(ValueCell(value));
        'chunk: loop {
            let limit = chunk.reprobe_limit();
            let mut idx = hash;
            let mut reprobes = 0;
            let (slot, slot_idx) = loop {
                let slot = chunk.slot(idx);
                match self.space.try_claim_for_copy(&slot.key, key, hash, guard) {
                    Claim::Claimed => {
                        chunk.used.incr(1);
                        break (slot, idx);
                    }
                    Claim::Held => break (slot, idx),
                    Claim::Collision => {}
                }
                idx = idx.wrapping_add(1);
                reprobes += 1;
                if reprobes >= limit {
                    chunk = self.ensure_next(chunk, guard);
                    continue 'chunk;
                }
            };
            loop {
                let cur = slot.value.load(Acquire, guard);
                if is_prime(cur) {
                    // The successor is itself being drained; follow along.
                    chunk = self.copy_slot_and_promote(chunk, slot_idx, guard);
                    continue 'chunk;
                }
                if !is_empty_val(cur) {
                    // A fresher write or a racing copy already landed here.
                    return;
                }
                match slot.value.compare_exchange(cur, pending, AcqRel, Acquire, guard) {
                    Ok(_) => return,
                    Err(e) => pending = e.new,
                }
            }
        }
    }

    // Every accessor of an in-flight chunk contributes copy work here, which
    // is what finishes the migration even if the triggering thread stalls.
    fn help_copy(
        &self,
        old: &Chunk<K, V, S>,
        new: &Chunk<K, V, S>,
        copy_all: bool,
        guard: &Guard,
    ) {
        let cap = old.cap();
        let backoff = Backoff::new();
        loop {
            if old.copy_done.load(Acquire) >= cap {
                self.try_promote(old, guard);
                return;
            }
            let start = old.copy_idx.fetch_add(COPY_CHUNK, Relaxed);
            if start >= cap {
                // The claim cursor ran out but completion lags behind a
                // stalled claimant. Late helpers sweep the whole chunk
                // instead of waiting on it.
                if !copy_all && start < cap * 2 {
                    return;
                }
                let mut done = 0;
                for idx in 0..cap {
                    if self.copy_slot(old, idx, new, guard) {
                        done += 1;
                    }
                }
                self.note_copied(old, done, guard);
                if !copy_all {
                    return;
                }
                backoff.spin();
                continue;
            }
            let end = (start + COPY_CHUNK).min(cap);
            let mut done = 0;
            for idx in start..end {
                if self.copy_slot(old, idx, new, guard) {
                    done += 1;
                }
            }
            self.note_copied(old, done, guard);
            if !copy_all {
                return;
            }
        }
    }

    fn note_copied(&self, chunk: &Chunk<K, V, S>, work: usize, guard: &Guard) {
        if work == 0 {
            return;
        }
        let done = chunk.copy_done.fetch_add(work, AcqRel) + work;
        debug_assert!(done <= chunk.cap(), "copied more slots than exist");
        if done == chunk.cap() {
            self.try_promote(chunk, guard);
        }
    }

    // Advance the head of the generation chain once a copy has drained.
    fn try_promote(&self, old: &Chunk<K, V, S>, guard: &Guard) {
        if old.copy_done.load(Acquire) < old.cap() {
            return;
        }
        let old_shared = Shared::from(old as *const Chunk<K, V, S>);
        if self.chunk.load(Acquire, guard) != old_shared {
            return;
        }
        let next = old.next.load(Acquire, guard);
        debug_assert!(!next.is_null());
        if self
            .chunk
            .compare_exchange(old_shared, next, AcqRel, Acquire, guard)
            .is_ok()
        {
            trace!("promoted successor chunk, retiring cap {}", old.cap());
            unsafe { guard.defer_destroy(old_shared) };
        }
    }

    // Remove every entry. Snapshot-and-remove keeps reclamation exact for
    // writers still inside the old generations.
    pub(crate) fn clear(&self) {
        let keys: Vec<K> = self.snapshot().map(|(k, _)| k).collect();
        for key in keys {
            let _ = self.put_if_match(&key, None, MatchOp::PresentOnly);
        }
    }

    // If a copy is in flight, the constructor drives it to completion first,
    // so the view never targets a chunk that is being drained.
    pub(crate) fn snapshot(&self) -> Snapshot<'_, K, V, S> {
        let guard = epoch::pin();
        let chunk = loop {
            let head_shared = self.chunk.load(Acquire, &guard);
            let head = unsafe { head_shared.deref() };
            let next = head.next.load(Acquire, &guard);
            if next.is_null() {
                break head as *const Chunk<K, V, S>;
            }
            self.help_copy(head, unsafe { next.deref() }, true, &guard);
            self.try_promote(head, &guard);
        };
        Snapshot {
            table: self,
            chunk,
            idx: 0,
            guard,
        }
    }
}

impl<K, V, S: KeySpace<K>> Drop for Table<K, V, S> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.chunk.load(Relaxed, guard);
            while !cur.is_null() {
                let next = cur.deref().next.load(Relaxed, guard);
                drop(cur.into_owned());
                cur = next;
            }
        }
    }
}

/// Lazy, finite, not restartable. Slots are scanned in index order; a slot
/// contributes a pair only if its value is live at the moment of the scan. A
/// migration that started after the snapshot point is chased through the
/// table so untouched keys are never dropped from the view.
pub struct Snapshot<'a, K, V, S: KeySpace<K>> {
    table: &'a Table<K, V, S>,
    chunk: *const Chunk<K, V, S>,
    idx: usize,
    guard: Guard,
}

impl<'a, K: Clone, V: Clone, S: KeySpace<K>> Iterator for Snapshot<'a, K, V, S> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        // The owned guard pins the epoch, which keeps the chunk alive even
        // after it is retired from the chain.
        let chunk = unsafe { &*self.chunk };
        while self.idx < chunk.cap() {
            let idx = self.idx;
            self.idx += 1;
            let slot = chunk.slot(idx);
            let v = slot.value.load(Acquire, &self.guard);
            if v.is_null() {
                if !is_prime(v) {
                    // Empty or tombstone.
                    continue;
                }
                // Dead prime: the pair moved on after the snapshot point.
                if let Some(key) = self.table.space.read_key(&slot.key, &self.guard) {
                    if let Some(value) = self.table.get(&key) {
                        return Some((key, value));
                    }
                }
                continue;
            }
            let key = match self.table.space.read_key(&slot.key, &self.guard) {
                Some(key) => key,
                None => unreachable!("valued slot with an unclaimed key"),
            };
            let value = unsafe { v.with_tag(0).deref() }.0.clone();
            return Some((key, value));
        }
        None
    }
}
