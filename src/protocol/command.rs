//! Command words of the microscope control protocol.
//!
//! Every request starts with an 8-byte ASCII identifier. Identifiers known at
//! compile time are built with [`CommandWord::from_static`], which is a `const fn`:
//! a word of the wrong length fails const evaluation, so a typo in the table
//! below cannot build.

use std::fmt;

use crate::error::{ScopeError, ScopeResult};

/// Length of every command identifier on the wire.
pub const COMMAND_WORD_LEN: usize = 8;

/// A validated 8-byte ASCII command identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandWord([u8; COMMAND_WORD_LEN]);

impl CommandWord {
    /// Build a command word at compile time.
    ///
    /// Used in a `const` context, a word that is not exactly 8 ASCII bytes is a
    /// compile error.
    pub const fn from_static(word: &'static str) -> Self {
        let bytes = word.as_bytes();
        assert!(
            bytes.len() == COMMAND_WORD_LEN,
            "command word must be exactly 8 bytes"
        );
        let mut out = [0u8; COMMAND_WORD_LEN];
        let mut i = 0;
        while i < COMMAND_WORD_LEN {
            assert!(bytes[i].is_ascii_graphic(), "command word must be printable ASCII");
            out[i] = bytes[i];
            i += 1;
        }
        Self(out)
    }

    /// Build a command word from runtime input.
    pub fn new(word: &str) -> ScopeResult<Self> {
        let bytes = word.as_bytes();
        if bytes.len() != COMMAND_WORD_LEN || !bytes.iter().all(u8::is_ascii_graphic) {
            return Err(ScopeError::InvalidCommandWord(word.to_string()));
        }
        let mut out = [0u8; COMMAND_WORD_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Raw bytes as written to the socket.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; COMMAND_WORD_LEN] {
        &self.0
    }

    /// The identifier as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII.
        std::str::from_utf8(&self.0).unwrap_or("????????")
    }
}

impl fmt::Debug for CommandWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandWord({})", self.as_str())
    }
}

impl fmt::Display for CommandWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const GET_XY: CommandWord = CommandWord::from_static("getxy___");
const GET_Z: CommandWord = CommandWord::from_static("getz____");
const GET_R: CommandWord = CommandWord::from_static("getr____");
const MOVE_XY: CommandWord = CommandWord::from_static("move____");
const MOVE_Z: CommandWord = CommandWord::from_static("movez___");
const MOVE_R: CommandWord = CommandWord::from_static("mover___");
const ACQUIRE: CommandWord = CommandWord::from_static("acquire_");
const STATUS: CommandWord = CommandWord::from_static("status__");
const PROGRESS: CommandWord = CommandWord::from_static("progress");
const CANCEL: CommandWord = CommandWord::from_static("cancel__");
const GET_FOV: CommandWord = CommandWord::from_static("getfov__");
const SHUTDOWN: CommandWord = CommandWord::from_static("shutdown");
const DISCONNECT: CommandWord = CommandWord::from_static("quitclnt");

/// Shape of the bytes that follow a command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPayload {
    /// Nothing follows the command word.
    None,
    /// A fixed number of big-endian `f32` values.
    Floats(usize),
    /// Flag-style text terminated by the end marker.
    Text,
}

/// Every operation understood by the hardware server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Read stage X,Y in micrometers.
    GetStageXY,
    /// Read stage Z in micrometers.
    GetStageZ,
    /// Read the rotation axis in ticks.
    GetRotation,
    /// Move stage X,Y.
    MoveStageXY,
    /// Move stage Z.
    MoveStageZ,
    /// Move the rotation axis.
    MoveRotation,
    /// Start an acquisition job.
    Acquire,
    /// Query acquisition status.
    Status,
    /// Query acquisition progress (current, total).
    Progress,
    /// Request cancellation of the running acquisition.
    Cancel,
    /// Read the camera field of view in micrometers.
    GetFieldOfView,
    /// Terminate the server process.
    Shutdown,
    /// Close this client's session on the server.
    Disconnect,
}

impl Command {
    /// All commands, in wire-table order.
    pub const ALL: [Command; 13] = [
        Command::GetStageXY,
        Command::GetStageZ,
        Command::GetRotation,
        Command::MoveStageXY,
        Command::MoveStageZ,
        Command::MoveRotation,
        Command::Acquire,
        Command::Status,
        Command::Progress,
        Command::Cancel,
        Command::GetFieldOfView,
        Command::Shutdown,
        Command::Disconnect,
    ];

    /// The 8-byte identifier for this command.
    #[must_use]
    pub const fn word(self) -> CommandWord {
        match self {
            Command::GetStageXY => GET_XY,
            Command::GetStageZ => GET_Z,
            Command::GetRotation => GET_R,
            Command::MoveStageXY => MOVE_XY,
            Command::MoveStageZ => MOVE_Z,
            Command::MoveRotation => MOVE_R,
            Command::Acquire => ACQUIRE,
            Command::Status => STATUS,
            Command::Progress => PROGRESS,
            Command::Cancel => CANCEL,
            Command::GetFieldOfView => GET_FOV,
            Command::Shutdown => SHUTDOWN,
            Command::Disconnect => DISCONNECT,
        }
    }

    /// What the client sends after the command word.
    #[must_use]
    pub const fn request_payload(self) -> RequestPayload {
        match self {
            Command::MoveStageXY => RequestPayload::Floats(2),
            Command::MoveStageZ | Command::MoveRotation => RequestPayload::Floats(1),
            Command::Acquire => RequestPayload::Text,
            _ => RequestPayload::None,
        }
    }

    /// Fixed number of response bytes the server sends back.
    ///
    /// `Status` replies may carry extra diagnostic text past this frame; see
    /// [`super::codec::decode_status`].
    #[must_use]
    pub const fn response_len(self) -> usize {
        match self {
            Command::GetStageXY | Command::GetFieldOfView | Command::Progress => 8,
            Command::GetStageZ | Command::GetRotation => 4,
            Command::Status => super::codec::STATUS_FRAME_LEN,
            Command::Cancel => super::codec::ACK.len(),
            _ => 0,
        }
    }

    /// Look up a command by its identifier.
    #[must_use]
    pub fn from_word(word: &[u8]) -> Option<Command> {
        Self::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.word().as_bytes().as_slice() == word)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.word().as_str())
    }
}
