//! Per-GPU reservation queue
//!
//! Reservations are kept in enqueue order. The front entry is the current
//! holder and is the only one with an open usage window; every other entry
//! is waiting. All mutations go through this type so the single-current
//! invariant is checked in one place.

use chrono::{DateTime, Duration, Utc};
use gpushare_core::Reservation;
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ReservationQueue {
    entries: VecDeque<Reservation>,
}

impl ReservationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The reservation holding the GPU, if any
    pub fn current(&self) -> Option<&Reservation> {
        self.entries.front().filter(|r| r.is_current())
    }

    pub fn current_mut(&mut self) -> Option<&mut Reservation> {
        self.entries.front_mut().filter(|r| r.is_current())
    }

    /// The reservation that will be promoted next
    pub fn next(&self) -> Option<&Reservation> {
        self.entries.get(1)
    }

    /// Waiting reservations in queue order
    pub fn waiting(&self) -> impl Iterator<Item = &Reservation> {
        self.entries.iter().skip(1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.entries.iter()
    }

    pub fn get(&self, id: Uuid) -> Option<&Reservation> {
        self.entries.iter().find(|r| r.id == id)
    }

    /// Append a reservation
    ///
    /// Into an empty queue the reservation becomes current immediately and
    /// `true` is returned; otherwise it waits behind the existing entries.
    pub fn enqueue(
        &mut self,
        mut reservation: Reservation,
        now: DateTime<Utc>,
        usage_period: Duration,
    ) -> bool {
        let becomes_current = self.entries.is_empty();
        if becomes_current {
            reservation.start_usage(now, usage_period);
        } else {
            reservation.usage_started = None;
            reservation.usage_expires = None;
        }
        self.entries.push_back(reservation);
        self.check();
        becomes_current
    }

    /// Remove the current holder
    ///
    /// Leaves the queue without a current holder until [`promote`] runs.
    ///
    /// [`promote`]: ReservationQueue::promote
    pub fn pop_current(&mut self) -> Option<Reservation> {
        self.current()?;
        self.entries.pop_front()
    }

    /// Open a usage window for the front reservation if it has none
    pub fn promote(&mut self, now: DateTime<Utc>, usage_period: Duration) -> Option<&Reservation> {
        let front = self.entries.front_mut()?;
        if front.is_current() {
            return None;
        }
        front.start_usage(now, usage_period);
        self.check();
        self.entries.front()
    }

    /// Remove a waiting reservation; the current holder is never removed here
    pub fn remove_waiting(&mut self, id: Uuid) -> Option<Reservation> {
        let index = self.entries.iter().position(|r| r.id == id)?;
        if self.entries[index].is_current() {
            return None;
        }
        self.entries.remove(index)
    }

    /// Remove every waiting reservation matching `predicate`
    pub fn drain_waiting<F>(&mut self, mut predicate: F) -> Vec<Reservation>
    where
        F: FnMut(&Reservation) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for reservation in self.entries.drain(..) {
            if !reservation.is_current() && predicate(&reservation) {
                removed.push(reservation);
            } else {
                kept.push_back(reservation);
            }
        }
        self.entries = kept;
        removed
    }

    /// Number of reservations ahead of the user's earliest one
    pub fn position_of(&self, user: &str) -> Option<usize> {
        self.entries.iter().position(|r| r.user == user)
    }

    /// Only the front entry has a usage window, and the front has one
    pub fn invariant_holds(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(index, r)| (index == 0) == r.is_current())
    }

    fn check(&self) {
        debug_assert!(self.invariant_holds(), "reservation queue invariant broken");
    }
}
