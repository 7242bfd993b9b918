//! JSON wire protocol spoken between cluster clients and workers.
//!
//! Field names are camelCase and variant tags kebab-case on the wire; the
//! serde attributes on each type carry the exact mapping.

pub mod commands;
pub mod events;
pub mod media;
pub mod states;

pub use commands::{Command, CommandBox, CommandReply};
pub use events::{Event, EventBox, Report, ReportState};
pub use media::*;
pub use states::{
    ConsumerState, ConsumerType, PipeTransportState, PlainTransportState, ProducerState,
    ProducerType, ResourceState, RouterState, WebRtcTransportState,
};
