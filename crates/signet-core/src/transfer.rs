//! Block-transfer orchestration for full-device backup and restore.
//!
//! A [`BlockTransferJob`] is resumed one step per device acknowledgment: every
//! method that advances the job returns the next [`Command`] to issue. Once a
//! begin command has been confirmed the job always finishes through its end
//! command, whatever the reason for stopping, unless the connection is lost.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{Operation, Outcome};
use crate::protocol::{BLOCK_SIZE, Command, MAX_BLOCK_ID};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Backup file is {actual} bytes, expected exactly {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Source ended early at block {index}: read {read} bytes")]
    ShortRead { index: u32, read: usize },

    #[error("Block {index} is {actual} bytes, expected {expected}")]
    BlockSize {
        index: u32,
        expected: usize,
        actual: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Block store geometry of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    pub block_size: usize,
    pub max_block_id: u16,
}

impl Default for BlockGeometry {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            max_block_id: MAX_BLOCK_ID,
        }
    }
}

impl BlockGeometry {
    pub fn block_count(&self) -> u32 {
        u32::from(self.max_block_id) + 1
    }

    /// Exact length of a backup file.
    pub fn expected_file_len(&self) -> u64 {
        u64::from(self.block_count()) * self.block_size as u64
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backup,
    Restore,
}

impl Direction {
    pub fn operation(&self) -> Operation {
        match self {
            Direction::Backup => Operation::Backup,
            Direction::Restore => Operation::Restore,
        }
    }

    fn begin_command(&self) -> Command {
        match self {
            Direction::Backup => Command::BeginBackup,
            Direction::Restore => Command::BeginRestore,
        }
    }

    fn end_command(&self) -> Command {
        match self {
            Direction::Backup => Command::EndBackup,
            Direction::Restore => Command::EndRestore,
        }
    }
}

/// Where the job is in its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Begin command issued, waiting for the button.
    AwaitingConfirmation,
    /// Block reads or writes in progress.
    Streaming,
    /// End command issued.
    Closing,
}

enum Endpoint {
    Backup {
        file: NamedTempFile,
        destination: PathBuf,
    },
    Restore {
        source: Box<dyn Read + Send>,
    },
}

/// A running backup or restore.
pub struct BlockTransferJob {
    direction: Direction,
    geometry: BlockGeometry,
    current_block_index: u32,
    endpoint: Endpoint,
    phase: TransferPhase,
    cancel_requested: bool,
    closing_outcome: Option<Outcome>,
}

impl std::fmt::Debug for BlockTransferJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTransferJob")
            .field("direction", &self.direction)
            .field("current_block_index", &self.current_block_index)
            .field("max_block_index", &self.geometry.max_block_id)
            .field("phase", &self.phase)
            .field("cancel_requested", &self.cancel_requested)
            .finish()
    }
}

impl BlockTransferJob {
    /// Prepare a backup into `destination`.
    ///
    /// Blocks go to a temporary file next to the destination, which is only
    /// replaced once the device has closed a complete backup.
    pub fn backup(destination: &Path, geometry: BlockGeometry) -> Result<Self, TransferError> {
        let dir = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file = NamedTempFile::new_in(dir)?;
        debug!(temp = %file.path().display(), "Backup staging file created");
        Ok(Self::with_endpoint(
            Direction::Backup,
            geometry,
            Endpoint::Backup {
                file,
                destination: destination.to_path_buf(),
            },
        ))
    }

    /// Prepare a restore from the file at `source`.
    ///
    /// Fails with [`TransferError::SizeMismatch`] unless the file holds
    /// exactly one block per block id.
    pub fn restore(source: &Path, geometry: BlockGeometry) -> Result<Self, TransferError> {
        let len = std::fs::metadata(source)?.len();
        check_backup_len(len, &geometry)?;
        let file = File::open(source)?;
        Ok(Self::with_endpoint(
            Direction::Restore,
            geometry,
            Endpoint::Restore {
                source: Box::new(BufReader::new(file)),
            },
        ))
    }

    /// Prepare a restore from an arbitrary reader announcing `len` bytes.
    pub fn restore_from_reader<R: Read + Send + 'static>(
        reader: R,
        len: u64,
        geometry: BlockGeometry,
    ) -> Result<Self, TransferError> {
        check_backup_len(len, &geometry)?;
        Ok(Self::with_endpoint(
            Direction::Restore,
            geometry,
            Endpoint::Restore {
                source: Box::new(reader),
            },
        ))
    }

    fn with_endpoint(direction: Direction, geometry: BlockGeometry, endpoint: Endpoint) -> Self {
        Self {
            direction,
            geometry,
            current_block_index: 0,
            endpoint,
            phase: TransferPhase::AwaitingConfirmation,
            cancel_requested: false,
            closing_outcome: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn current_block_index(&self) -> u32 {
        self.current_block_index
    }

    pub fn max_block_index(&self) -> u16 {
        self.geometry.max_block_id
    }

    /// All blocks transferred.
    pub fn is_complete(&self) -> bool {
        self.current_block_index == self.geometry.block_count()
    }

    /// `(blocks transferred, total blocks)`.
    pub fn progress(&self) -> (u64, u64) {
        (
            u64::from(self.current_block_index),
            u64::from(self.geometry.block_count()),
        )
    }

    /// The button-confirmed command that opens the transfer.
    pub fn start(&mut self) -> Command {
        self.phase = TransferPhase::AwaitingConfirmation;
        self.direction.begin_command()
    }

    /// Stop before the next block. Returns `false` if already requested.
    /// Also `false` once the end command is out.
    pub fn request_cancel(&mut self) -> bool {
        if self.cancel_requested || self.phase == TransferPhase::Closing {
            return false;
        }
        info!(direction = ?self.direction, block = self.current_block_index, "Transfer cancel requested");
        self.cancel_requested = true;
        true
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Begin command confirmed: first block step.
    pub fn on_begin_confirmed(&mut self) -> Command {
        self.phase = TransferPhase::Streaming;
        self.next_step()
    }

    /// A `read_block` answer arrived with `data`.
    pub fn on_block_read(&mut self, data: &[u8]) -> Command {
        let index = self.current_block_index;
        if data.len() != self.geometry.block_size {
            let err = TransferError::BlockSize {
                index,
                expected: self.geometry.block_size,
                actual: data.len(),
            };
            return self.fail(err);
        }
        if let Endpoint::Backup { file, .. } = &mut self.endpoint
            && let Err(e) = file.write_all(data)
        {
            return self.fail(e.into());
        }
        debug!(block = index, "Block read");
        self.current_block_index += 1;
        self.next_step()
    }

    /// A `read_block` was dismissed without data; read the same block again.
    pub fn repeat_read(&mut self) -> Command {
        if self.cancel_requested {
            return self.close(Outcome::Cancelled);
        }
        debug!(block = self.current_block_index, "Repeating block read");
        Command::ReadBlock {
            index: self.current_block_index as u16,
        }
    }

    /// A `write_block` was acknowledged.
    pub fn on_block_written(&mut self) -> Command {
        debug!(block = self.current_block_index, "Block written");
        self.current_block_index += 1;
        self.next_step()
    }

    /// Issue the end command, remembering why the transfer stopped.
    pub fn close(&mut self, outcome: Outcome) -> Command {
        if self.closing_outcome.is_none() {
            self.closing_outcome = Some(outcome);
        }
        self.phase = TransferPhase::Closing;
        self.direction.end_command()
    }

    /// End command acknowledged. Commits a complete backup to its destination.
    pub fn finish(self) -> Outcome {
        let outcome = self.closing_outcome.unwrap_or(Outcome::Completed);
        match (self.endpoint, &outcome) {
            (Endpoint::Backup { file, destination }, Outcome::Completed) => {
                match commit_backup(file, &destination) {
                    Ok(()) => {
                        info!(path = %destination.display(), "Backup written");
                        outcome
                    }
                    Err(e) => Outcome::Failed(e.to_string()),
                }
            }
            _ => outcome,
        }
    }

    /// Connection lost. Nothing more is sent and any staged backup is discarded.
    pub fn abandon(self) -> Outcome {
        warn!(
            direction = ?self.direction,
            block = self.current_block_index,
            "Transfer abandoned"
        );
        Outcome::Incomplete
    }

    fn next_step(&mut self) -> Command {
        if self.cancel_requested {
            return self.close(Outcome::Cancelled);
        }
        if self.is_complete() {
            return self.close(Outcome::Completed);
        }
        let index = self.current_block_index as u16;
        match self.direction {
            Direction::Backup => Command::ReadBlock { index },
            Direction::Restore => match self.read_source_block() {
                Ok(data) => Command::WriteBlock { index, data },
                Err(e) => self.fail(e),
            },
        }
    }

    fn read_source_block(&mut self) -> Result<Vec<u8>, TransferError> {
        let index = self.current_block_index;
        let block_size = self.geometry.block_size;
        let Endpoint::Restore { source } = &mut self.endpoint else {
            return Err(TransferError::Io(std::io::Error::other(
                "restore source missing",
            )));
        };
        let mut buf = vec![0u8; block_size];
        let mut filled = 0;
        while filled < block_size {
            match source.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled < block_size {
            return Err(TransferError::ShortRead {
                index,
                read: filled,
            });
        }
        Ok(buf)
    }

    fn fail(&mut self, err: TransferError) -> Command {
        warn!(direction = ?self.direction, error = %err, "Transfer failed, closing device session");
        self.close(Outcome::Failed(err.to_string()))
    }
}

/// Validate a backup file length against the device geometry.
pub fn check_backup_len(len: u64, geometry: &BlockGeometry) -> Result<(), TransferError> {
    let expected = geometry.expected_file_len();
    if len != expected {
        return Err(TransferError::SizeMismatch {
            expected,
            actual: len,
        });
    }
    Ok(())
}

fn commit_backup(mut file: NamedTempFile, destination: &Path) -> Result<(), TransferError> {
    file.flush()?;
    file.as_file().sync_all()?;
    file.persist(destination).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn small() -> BlockGeometry {
        BlockGeometry {
            block_size: 8,
            max_block_id: 2,
        }
    }

    #[test]
    fn test_backup_reads_every_block_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("device.bak");
        let mut job = BlockTransferJob::backup(&dest, small()).unwrap();

        assert_eq!(job.start(), Command::BeginBackup);
        assert_eq!(job.on_begin_confirmed(), Command::ReadBlock { index: 0 });
        assert_eq!(job.on_block_read(&[0; 8]), Command::ReadBlock { index: 1 });
        assert_eq!(job.on_block_read(&[1; 8]), Command::ReadBlock { index: 2 });
        assert_eq!(job.on_block_read(&[2; 8]), Command::EndBackup);
        assert!(job.is_complete());
        assert_eq!(job.progress(), (3, 3));

        // Nothing at the destination until the end is acknowledged.
        assert!(!dest.exists());
        assert_eq!(job.finish(), Outcome::Completed);

        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written.len(), 24);
        assert_eq!(&written[8..16], &[1; 8]);
    }

    #[test]
    fn test_backup_cancel_stops_before_next_block() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("device.bak");
        let mut job = BlockTransferJob::backup(&dest, small()).unwrap();
        job.start();
        job.on_begin_confirmed();

        assert!(job.request_cancel());
        assert!(!job.request_cancel());
        assert_eq!(job.on_block_read(&[0; 8]), Command::EndBackup);
        assert_eq!(job.phase(), TransferPhase::Closing);
        assert_eq!(job.finish(), Outcome::Cancelled);
        assert!(!dest.exists());
    }

    #[test]
    fn test_cancel_after_end_command_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("device.bak");
        let mut job = BlockTransferJob::backup(&dest, small()).unwrap();
        job.start();
        job.on_begin_confirmed();
        job.on_block_read(&[0; 8]);
        job.on_block_read(&[1; 8]);
        assert_eq!(job.on_block_read(&[2; 8]), Command::EndBackup);

        assert!(!job.request_cancel());
        assert!(!job.cancel_requested());
        assert_eq!(job.finish(), Outcome::Completed);
        assert!(dest.exists());
    }

    #[test]
    fn test_backup_repeats_dismissed_read() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("device.bak");
        let mut job = BlockTransferJob::backup(&dest, small()).unwrap();
        job.start();
        job.on_begin_confirmed();
        job.on_block_read(&[0; 8]);

        assert_eq!(job.repeat_read(), Command::ReadBlock { index: 1 });
        assert_eq!(job.progress(), (1, 3));
        job.request_cancel();
        assert_eq!(job.repeat_read(), Command::EndBackup);
    }

    #[test]
    fn test_backup_wrong_block_size_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("device.bak");
        let mut job = BlockTransferJob::backup(&dest, small()).unwrap();
        job.start();
        job.on_begin_confirmed();

        assert_eq!(job.on_block_read(&[0; 5]), Command::EndBackup);
        assert!(matches!(job.finish(), Outcome::Failed(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn test_restore_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bak");
        std::fs::write(&path, vec![0u8; 23]).unwrap();

        let err = BlockTransferJob::restore(&path, small()).unwrap_err();
        match err {
            TransferError::SizeMismatch { expected, actual } => {
                assert_eq!(expected, 24);
                assert_eq!(actual, 23);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_restore_writes_blocks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.bak");
        let mut content = vec![0u8; 24];
        content[8..16].fill(7);
        std::fs::write(&path, &content).unwrap();

        let mut job = BlockTransferJob::restore(&path, small()).unwrap();
        assert_eq!(job.start(), Command::BeginRestore);
        assert_eq!(
            job.on_begin_confirmed(),
            Command::WriteBlock {
                index: 0,
                data: vec![0; 8]
            }
        );
        assert_eq!(
            job.on_block_written(),
            Command::WriteBlock {
                index: 1,
                data: vec![7; 8]
            }
        );
        assert!(matches!(
            job.on_block_written(),
            Command::WriteBlock { index: 2, .. }
        ));
        assert_eq!(job.on_block_written(), Command::EndRestore);
        assert_eq!(job.finish(), Outcome::Completed);
    }

    #[test]
    fn test_restore_short_read_closes_session() {
        // Reader claims the right length but delivers less.
        let reader = Cursor::new(vec![3u8; 12]);
        let mut job = BlockTransferJob::restore_from_reader(reader, 24, small()).unwrap();
        job.start();
        assert!(matches!(
            job.on_begin_confirmed(),
            Command::WriteBlock { index: 0, .. }
        ));
        assert_eq!(job.on_block_written(), Command::EndRestore);
        match job.finish() {
            Outcome::Failed(message) => assert!(message.contains("block 1")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_abandon_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("device.bak");
        let mut job = BlockTransferJob::backup(&dest, small()).unwrap();
        job.start();
        job.on_begin_confirmed();
        job.on_block_read(&[0; 8]);
        assert_eq!(job.abandon(), Outcome::Incomplete);
        assert!(!dest.exists());
    }

    #[test]
    fn test_default_geometry_file_len() {
        assert_eq!(BlockGeometry::default().expected_file_len(), 127 * 2048);
    }
}
