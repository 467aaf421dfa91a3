// src/lib.rs  —  crate root
//
// `cw-engine`: a real-time Morse-code signal engine — timing solver, tone
// queue/dispatcher, sine generator, audio sinks, iambic keyer, straight key,
// and a timestamp-driven receive decoder. No CLI, no TUI, no character
// tables: those are the embedder's job (§1 Non-goals). `Engine` is the one
// handle embedders construct; the individual subsystem types are public for
// callers who want to compose their own wiring instead.

pub mod debug;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod generator;
pub mod keyer;
pub mod receiver;
pub mod sink;
pub mod straight_key;
pub mod timing;
pub mod tone_queue;

pub use debug::DebugFlags;
pub use dispatcher::{Dispatcher, DispatcherState, KeyingCallback};
pub use engine::Engine;
pub use error::{CwError, CwResult, ErrorKind};
pub use generator::{Generator, ToneState};
pub use keyer::Keyer;
pub use receiver::{
    CharacterOutput, Receiver, ReceiverState, RepresentationLookup, RepresentationOutput,
    Statistics, Timestamp,
};
pub use sink::{Sink, SinkFamily};
pub use straight_key::StraightKey;
pub use timing::{ElementTiming, RecvParams, SendParams, TimingSolver};
pub use tone_queue::{Tone, ToneQueue};
