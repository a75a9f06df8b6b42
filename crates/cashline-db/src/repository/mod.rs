//! # Repository Module
//!
//! Database repository implementations for the sync engine.
//!
//! ## Who Uses What
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Register (write side)          Engine (read/dispatch side)            │
//! │  ─────────────────────          ───────────────────────────            │
//! │  OutboxRepository               SyncLockRepository   (lease)           │
//! │   └─ record + enqueue           SyncCommandRepository (drain, mark)    │
//! │      in one transaction         BatchRepository      (handlers)        │
//! │                                 OrderRepository      (handlers)        │
//! │  SequenceRepository ◄───────── used by every enqueue                  │
//! │                                 RefundRepository     (handlers)        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`SyncCommandRepository`](command::SyncCommandRepository) - Command queue
//! - [`SyncLockRepository`](lock::SyncLockRepository) - Lease lock singleton
//! - [`SequenceRepository`](sequence::SequenceRepository) - Sequence counter
//! - [`OutboxRepository`](outbox::OutboxRepository) - Record + command writes
//! - [`BatchRepository`](batch::BatchRepository) - Cash batches
//! - [`OrderRepository`](order::OrderRepository) - Orders and order lines
//! - [`RefundRepository`](refund::RefundRepository) - Refunds

pub mod batch;
pub mod command;
pub mod lock;
pub mod order;
pub mod outbox;
pub mod refund;
pub mod sequence;
