//! Save-state reconciliation for A Link to the Past played online.
//!
//! This crate holds everything that decides what to write into a running
//! console: per-player memory mirrors, merge policies, the 65816 routine
//! generator and the confirmation bookkeeping. It performs no I/O; the
//! [`game::Game`] state machine is driven by a session that owns the device
//! and the relay connection.

/// A Link to the Past memory layout and the table of synced fields.
pub mod alttp;

/// 65816 instruction emitter with a matching disassembly listing.
pub mod asm;

/// Confirmation bytes written by generated routines.
pub mod confirm;

/// Reconciliation state machine for one session.
pub mod game;

/// Time-ordered small key counters.
pub mod keys;

/// Shadow copies of console memory and device address translation.
pub mod mirror;

/// Notification fan-out to front ends.
pub mod notify;

/// Per-game payload carried inside relay messages.
pub mod payload;

/// Local and remote players.
pub mod player;

/// Merge policies and the field table.
pub mod sync;

/// Update routine layout and budgeting.
pub mod update;
