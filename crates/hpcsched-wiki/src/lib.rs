//! hpcsched-wiki: Wiki resource manager protocol.
//!
//! Talks to SLURM-style resource managers over the line-oriented Wiki
//! protocol and keeps scheduler state in step with what they report.
//!
//! # Components
//!
//! - **`codec`**: `COUNT#id:K=V;K=V#...` record sets, inline XML aware
//! - **`frame`**: length-prefixed framing, `CK=` envelopes, `SC=` status
//! - **`auth`**: CRC16/pseudo-DES and HMAC-SHA256 checksums
//! - **`command`**: outbound `CMD=<verb> ARG=<id> ...` strings
//! - **`client`**: per-RM TCP client with backup fallback
//! - **`apply`**: attribute registries for nodes, jobs and VMs
//! - **`rm`**: RM adapter: queries, job control, preemption backend
//!
//! # Architecture
//!
//! ```text
//!   SchedulerContext ◄── apply ◄── codec ◄──┐
//!                                           │
//!   WikiRm ── command ──► WikiClient ── frame/auth ──► TCP ──► RM
//!     ▲                      (primary, then backup)
//!     └── PreemptBackend (hpcsched-placement)
//! ```

pub mod apply;
pub mod auth;
pub mod client;
pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod rm;

pub use apply::ApplyReport;
pub use client::{ClientState, WikiClient};
pub use codec::{WikiMessage, decode, decode_record, encode, encode_record};
pub use command::{WikiCommand, WikiVerb};
pub use error::{WikiError, WikiResult};
pub use frame::WikiResponse;
pub use rm::{CancelKind, WikiRm, task_list_string};
