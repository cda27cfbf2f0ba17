//! Booking validation and availability engine for appointment-based shops.
//!
//! [`engine::BookingValidator`] decides whether a proposed appointment may be
//! created. [`ledger::Ledger`] wraps it with an in-memory, WAL-backed store so
//! validation and creation happen as one serialized step per shop.

pub mod compactor;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod ports;
pub mod store;
pub mod wal;
