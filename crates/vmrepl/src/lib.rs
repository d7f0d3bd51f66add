//! Supervisor for slow-booting interactive REPL instances.
//!
//! Each instance is a long-lived child process (typically an emulated machine
//! booting into a REPL) attached to a pseudo-terminal and identified by a key
//! such as a target architecture:
//!
//! ```text
//! caller --evaluate(key, line)--> Registry --gate--> Session --PTY--> child
//!                                    |                                  |
//!                               idle reaper                      "lona> " prompt
//! ```
//!
//! ## Guarantees
//!
//! 1. **At most one instance per key.** Instances are booted on first use.
//! 2. **One request at a time per key.** Requests on the same key queue in
//!    arrival order; requests on different keys run in parallel.
//! 3. **Queries never block.** `is_running` and `started_at` answer while an
//!    evaluation is in flight.
//! 4. **No orphans.** Every exit path, including panics, tears down the
//!    child's whole process group.

pub mod config;
pub mod error;
pub mod key;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod sanitize;
pub mod session;
pub mod terminal;

pub use config::{LaunchCommand, SupervisorConfig};
pub use error::{SupervisorError, SupervisorResult};
pub use key::InstanceKey;
pub use registry::Registry;
pub use sanitize::clean_output;
pub use session::{SessionInfo, SessionState};
