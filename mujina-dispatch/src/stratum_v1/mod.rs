//! Stratum v1 mining protocol client.
//!
//! The protocol uses JSON-RPC over TCP with newline-delimited messages.
//!
//! # Protocol Overview
//!
//! Stratum v1 is a bidirectional, event-driven protocol:
//!
//! - **Client requests**: subscribe, authorize, submit, suggest_difficulty
//! - **Server notifications**: mining.notify (new work), mining.set_difficulty,
//!   mining.set_version_mask, client.reconnect, client.show_message
//! - **Server responses**: Results for client requests (boolean or error array)
//!
//! # Architecture
//!
//! There is no event channel between the client and the rest of the
//! dispatcher. The client writes the live job straight into its pool's
//! session under the session lock, and the scheduler builds work from it on
//! demand with [`gen_stratum_work`]. Solved shares come back through the
//! pool's outbound queue to the client's send loop; answers are matched to
//! in-flight shares by request id and accounted in [`crate::submit`].
//!
//! ```rust,ignore
//! let pool = engine.registry.current();
//! engine.tasks.spawn(stratum_v1::stratum_task(engine.clone(), pool.clone()));
//!
//! // Once `pool.stratum_ready()`:
//! let work = stratum_v1::gen_stratum_work(&engine, &pool)?;
//! ```

mod client;
mod connection;
mod error;
mod messages;
mod work;

pub use client::{stratum_task, READ_TIMEOUT, RECONNECT_BACKOFF, RESUBMIT_WINDOW, SOLE_POOL_BACKOFF};
pub use error::{StratumError, StratumResult};
pub use messages::{JobNotification, JsonRpcMessage, SubmitParams, Subscription};
pub use work::{build_job, gen_stratum_work};
