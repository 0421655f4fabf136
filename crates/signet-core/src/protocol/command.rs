//! Commands issued to the device.

use std::fmt;

/// Discriminant of a device command, used for correlation and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Startup,
    Login,
    Logout,
    ReadBlock,
    WriteBlock,
    BeginBackup,
    EndBackup,
    BeginRestore,
    EndRestore,
    ErasePages,
    WriteFlash,
    ResetDevice,
    Wipe,
    BeginFirmwareUpdate,
    GetProgress,
    Initialize,
    UpdateEntry,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Startup => "startup",
            CommandKind::Login => "login",
            CommandKind::Logout => "logout",
            CommandKind::ReadBlock => "read_block",
            CommandKind::WriteBlock => "write_block",
            CommandKind::BeginBackup => "begin_backup",
            CommandKind::EndBackup => "end_backup",
            CommandKind::BeginRestore => "begin_restore",
            CommandKind::EndRestore => "end_restore",
            CommandKind::ErasePages => "erase_pages",
            CommandKind::WriteFlash => "write_flash",
            CommandKind::ResetDevice => "reset_device",
            CommandKind::Wipe => "wipe",
            CommandKind::BeginFirmwareUpdate => "begin_firmware_update",
            CommandKind::GetProgress => "get_progress",
            CommandKind::Initialize => "initialize",
            CommandKind::UpdateEntry => "update_entry",
        };
        f.write_str(name)
    }
}

impl CommandKind {
    /// Whether the device holds this command until the user presses the button.
    pub fn requires_button(&self) -> bool {
        matches!(
            self,
            CommandKind::Login
                | CommandKind::BeginBackup
                | CommandKind::BeginRestore
                | CommandKind::Wipe
                | CommandKind::BeginFirmwareUpdate
                | CommandKind::Initialize
                | CommandKind::UpdateEntry
        )
    }
}

/// Device-side long operation observed through `get_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Wiping,
    ErasingPages,
    Initializing,
}

impl fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressPhase::Wiping => write!(f, "wiping"),
            ProgressPhase::ErasingPages => write!(f, "erasing pages"),
            ProgressPhase::Initializing => write!(f, "initializing"),
        }
    }
}

/// A command together with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Startup,
    /// Derived key; hashing happens outside the session.
    Login { key: Vec<u8> },
    Logout,
    ReadBlock { index: u16 },
    WriteBlock { index: u16, data: Vec<u8> },
    BeginBackup,
    EndBackup,
    BeginRestore,
    EndRestore,
    /// Sorted page indices.
    ErasePages { pages: Vec<u16> },
    WriteFlash { address: u32, data: Vec<u8> },
    ResetDevice,
    Wipe,
    BeginFirmwareUpdate,
    GetProgress { since: u32, phase: ProgressPhase },
    Initialize {
        key: Vec<u8>,
        hashfn: Vec<u8>,
        salt: Vec<u8>,
    },
    UpdateEntry {
        id: u16,
        data: Vec<u8>,
        mask: Vec<u8>,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Startup => CommandKind::Startup,
            Command::Login { .. } => CommandKind::Login,
            Command::Logout => CommandKind::Logout,
            Command::ReadBlock { .. } => CommandKind::ReadBlock,
            Command::WriteBlock { .. } => CommandKind::WriteBlock,
            Command::BeginBackup => CommandKind::BeginBackup,
            Command::EndBackup => CommandKind::EndBackup,
            Command::BeginRestore => CommandKind::BeginRestore,
            Command::EndRestore => CommandKind::EndRestore,
            Command::ErasePages { .. } => CommandKind::ErasePages,
            Command::WriteFlash { .. } => CommandKind::WriteFlash,
            Command::ResetDevice => CommandKind::ResetDevice,
            Command::Wipe => CommandKind::Wipe,
            Command::BeginFirmwareUpdate => CommandKind::BeginFirmwareUpdate,
            Command::GetProgress { .. } => CommandKind::GetProgress,
            Command::Initialize { .. } => CommandKind::Initialize,
            Command::UpdateEntry { .. } => CommandKind::UpdateEntry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_button_commands() {
        assert!(Command::BeginBackup.kind().requires_button());
        assert!(Command::Login { key: vec![1] }.kind().requires_button());
        assert!(!Command::ReadBlock { index: 0 }.kind().requires_button());
        assert!(!Command::EndRestore.kind().requires_button());
    }
}
