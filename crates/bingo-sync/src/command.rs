//! Optimistic local edits as explicit commands.
//!
//! A [`LocalCommand`] applied by the reconciler yields a [`Tentative`] that carries
//! the pre-mutation checkpoint. The caller settles it once the server has answered:
//! commit keeps the edit, rollback restores only what the command touched, so frames
//! merged in the meantime survive.

use bingo_core::{PlayerState, WinType, WinnerInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    SetMark {
        position: u32,
        marked: bool,
    },
    ClaimWin {
        win_type: WinType,
        winning_positions: Vec<u32>,
    },
}

/// What the reconciler looked like before a command, restricted to the fields a
/// command can change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub player_state: PlayerState,
    pub winner: Option<WinnerInfo>,
    pub completed_at: Option<i64>,
}

#[must_use = "a tentative edit must be committed or rolled back"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tentative {
    command: LocalCommand,
    checkpoint: Checkpoint,
}

impl Tentative {
    pub(crate) fn new(command: LocalCommand, checkpoint: Checkpoint) -> Self {
        Self {
            command,
            checkpoint,
        }
    }

    pub fn command(&self) -> &LocalCommand {
        &self.command
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub(crate) fn into_parts(self) -> (LocalCommand, Checkpoint) {
        (self.command, self.checkpoint)
    }
}
