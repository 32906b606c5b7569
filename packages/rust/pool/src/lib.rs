//! Bounded worker pool for fetching and parsing recap pages.
//!
//! [`RecapPool`] keeps a fixed number of long-lived workers, each owning one
//! fetch session. Jobs queue in FIFO order and each resolves through its own
//! [`JobHandle`]. A worker that crashes fails only its in-flight job and is
//! replaced in the same slot; [`RecapPool::close`] rejects pending jobs and
//! gives every worker a grace period before terminating it.

pub mod http;
pub mod pool;
pub mod protocol;
pub mod session;
mod worker;

pub use http::{HttpRecapSource, HttpSession};
pub use pool::{JobHandle, PoolStats, RecapPool};
pub use protocol::{ControlCommand, JobId, WorkerRequest, WorkerResponse};
pub use session::{RecapSession, RecapSource, parse_direct};
