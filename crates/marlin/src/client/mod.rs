//! Session, results and the supporting caches.

pub mod prepare_cache;
pub mod redo;
pub mod result;
pub mod row;
pub mod session;

pub use result::{CompleteResult, OkInfo, QueryResult};
pub use row::{Row, RowEncoding};
pub use session::{KillHandle, Session, Statement, StreamingResult};
