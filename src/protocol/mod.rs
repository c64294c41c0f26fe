//! Wire protocol of the microscope control server.
//!
//! Stateless: command identifiers, numeric codecs, status decoding and the
//! acquisition text message. I/O lives in [`crate::device`].

pub mod codec;
pub mod command;
pub mod message;

pub use codec::{StatusReply, END_MARKER, STATUS_FRAME_LEN};
pub use command::{Command, CommandWord, RequestPayload, COMMAND_WORD_LEN};
pub use message::{AcquisitionCommand, AngleExposure, ZStack};
