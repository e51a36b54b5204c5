//! nfs4slow - call correlation and trace assembly for the NFSv4 open path
//!
//! Every `nfs4_file_open` call gets a record in a fixed-capacity correlation
//! table. Instrumented points inside the open path append to that record's
//! ordered trace, bump saturating visit counters, and copy structured client
//! state (stateids, open-state counters, client recovery flags) into it. When
//! the call returns, an emission filter decides whether the record is worth
//! keeping; kept records are encoded into a fixed 1170-byte layout and pushed
//! to a lossy output channel drained by a consumer thread.
//!
//! The hot path ([`engine::Engine::on_point`]) never blocks and never
//! allocates. The attachment layer is modelled by [`notification`]; the
//! [`replay`] driver feeds recorded notifications through the engine.

pub mod call_record;
pub mod cli;
pub mod clock;
pub mod config;
pub mod correlation;
pub mod emission;
pub mod engine;
pub mod event_record;
pub mod layout;
pub mod notification;
pub mod probes;
pub mod render;
pub mod replay;
pub mod ring_buffer; // Lock-free output channel + sidecar consumer
pub mod snapshot;
pub mod template_store;
