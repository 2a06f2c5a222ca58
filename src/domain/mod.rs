//! Domain types shared by every layer: records, filters and change events.

pub mod error;
pub mod filter;
pub mod types;

pub use filter::{CmpOp, Filter, Filters, Order, SelectQuery};
pub use types::{ChangeEvent, ChangeKind, Record, record_id};
