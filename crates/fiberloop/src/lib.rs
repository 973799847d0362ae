//! fiberloop: a completion-driven event loop with cooperative tasks
//!
//! A [`Loop`] blocks on a completion port, dispatches finished operations to
//! registered handles and resumes tasks parked on one of three timer
//! classes:
//!
//! - **sleep**: fires after an absolute period of loop time
//! - **idle**: fires after a period with no completions, checked only when
//!   a wait times out
//! - **timeout**: fires after a period with no completions, checked every
//!   iteration
//!
//! Tasks run one at a time on their loop and give up control only at a
//! suspension point. Loops on different threads cooperate by posting work
//! ([`Loop::post`], [`Loop::exec`]) and by waiting for each other to finish
//! ([`Loop::wait`], [`Loop::stop_and_wait`]).
//!
//! ```ignore
//! use fiberloop::{Loop, LoopConfig};
//!
//! Loop::run_with(LoopConfig::default(), |lp| {
//!     lp.sleep(10).unwrap();
//!     lp.stop().unwrap();
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arena;
mod asynch;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod pool;
pub mod port;
pub mod scheduler;
pub mod timer;
pub mod wait;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, LoopConfig};
pub use error::{status_code, translate, LoopError, LoopResult, OK};
pub use event_loop::{Loop, LoopFn, LoopId, LoopStats, LoopStatus};
pub use port::{Completable, CompletionEvent, Descriptor, HandleKey};
pub use scheduler::{SchedulerStats, Task, TaskId, TaskState, TaskStatus};
pub use timer::{TimerKey, TimerKind};
pub use wait::{WaitKey, WaitRegistration};
