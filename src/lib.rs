//! Threaded NMSG pipeline.
//!
//! Typed, timestamped payload records travel in wire-serialized containers
//! between inputs (byte streams, datagram sockets, presentation text, pcap
//! captures) and outputs (streams, sockets, presentation text, callbacks,
//! channels). The [`io::Io`] context multiplexes N inputs onto M outputs
//! with one worker thread per input, striping or mirroring containers
//! across writers, with optional zlib compression, container-level
//! fragmentation over datagram transports, and count/interval close
//! triggers. IP datagram reconstruction lives in the `ip-reasm` crate.

pub mod config;
pub mod container;
pub mod error;
pub mod frag;
pub mod input;
pub mod io;
pub mod logging;
pub mod module;
pub mod output;
pub mod payload;
pub mod pcap;
pub mod rate;

pub use config::PipelineConfig;
pub use container::{Nmsg, NmsgFragment, NmsgPayload};
pub use error::{Error, Result};
pub use frag::FragTable;
pub use input::{NmsgInput, PresInput};
pub use io::{CloseEvent, CloseType, Io, IoBreaker, IoType, OutputHandle, OutputMode};
pub use module::{ModuleSet, MsgModule, PresParser};
pub use output::{
    CallbackOutput, ChannelOutput, DatagramOutput, Output, OutputKind, PresOutput, StreamOutput,
    WriteOutcome,
};
pub use pcap::PcapFileSource;
pub use rate::Rate;
