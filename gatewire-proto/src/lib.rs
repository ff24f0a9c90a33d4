//! Wire protocol for gatewire.
//!
//! Both endpoints of a gateway share this crate: the typed value universe
//! ([`Value`]), the versioned binary codec ([`dump`]/[`load`]), and the
//! frame layer ([`Frame`], [`MsgCode`]) that multiplexes channels over one
//! byte stream. Nothing in here spawns threads or touches sockets; policy
//! lives in `gatewire-exec`.

#![deny(missing_docs)]

mod codec;
mod frame;
mod value;

pub use codec::{dump, load, load_with, DumpError, LoadError, StrCoercion, FORMAT_VERSION};
pub use frame::{Frame, FrameError, MsgCode};
pub use value::Value;
