//! Auplay Core - Audio player engine
//!
//! Per-player audio engines driven by named method calls: each player owns a
//! media pipeline and a thread servicing its bus, tracks the host's desired
//! playback state and reports preparation, duration, seek completion, end of
//! stream and errors as events.

pub mod command;
pub mod decoder;
pub mod event;
pub mod handle;
pub mod output;
pub mod pipeline;
pub mod playbin;
pub mod player;
pub mod registry;
pub mod thread;

#[cfg( test )]
mod testing;

pub use command::{ Command, CommandError, CommandRouter, MethodCall, PlayerAction };
pub use event::{ EventSink, PlayerEvent };
pub use handle::PipelineHandle;
pub use pipeline::{ Bus, BusMessage, Pipeline, PipelineError, PipelineFactory, PipelineState };
pub use playbin::{ LocalPlaybin, LocalPlaybinFactory, PlaybinOptions };
pub use player::{ AudioPlayer, PlayerError, PlayerStatus };
pub use registry::{ PlayerRegistry, RegistryError };
pub use thread::PlayerThread;
