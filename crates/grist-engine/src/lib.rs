//! grist: a dynamic binary translator for x86-64
//!
//! The engine interposes on running native code: it decodes machine code
//! just-in-time into a typed IR (`ir`, `decode`), explores control flow on
//! demand into a local control-flow graph (`trace`), invites instrumentation
//! clients to rewrite it (`client`), re-splits the result into straight-line
//! fragments (`fragment`), lowers those through a fixed pass pipeline
//! (`assemble`), and executes the encoded result out of a managed code cache
//! (`cache`) whose blocks are stitched together by lazily patched edges
//! (`edge`).
//!
//! All process-wide state lives in a [`Context`]; tests build as many
//! contexts as they like.

#![warn(rust_2018_idioms)]

pub mod assemble;
pub mod cache;
pub mod channel;
pub mod client;
pub mod context;
pub mod decode;
pub mod edge;
pub mod fragment;
pub mod ir;
pub mod meta;
pub mod thread;
pub mod trace;

pub use channel::Channel;
pub use client::{Client, EntryPointKind, InitReason};
pub use context::{Context, Options, TranslateError};
pub use thread::Thread;
