//! Tuple-level access to table storage.
//!
//! - **value/schema/tuple**: the value model everything operates on;
//! - **heap**: a table's backing file of slotted pages;
//! - **scan**: the iterator operators pull tuples through.

pub mod heap;
pub mod scan;
pub mod schema;
pub mod tuple;
pub mod value;

pub use heap::HeapFile;
pub use scan::TableScan;
pub use schema::{Column, Schema};
pub use tuple::{RecordId, Tuple};
pub use value::{DataType, Field};
