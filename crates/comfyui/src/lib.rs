//! ComfyUI generation client.
//!
//! Submits a workflow to a ComfyUI server, waits for the job's
//! completion event on the server's WebSocket, then pulls the produced
//! image through the history and view endpoints and stores it locally.
//!
//! [`session::GenerationSession`] runs one job end to end;
//! [`runner::GenerationRunner`] runs sessions on a background task.

pub mod api;
pub mod artifact;
pub mod client;
pub mod correlator;
pub mod error;
pub mod events;
pub mod job;
pub mod messages;
pub mod runner;
pub mod session;
