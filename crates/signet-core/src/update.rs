//! Firmware update orchestration.
//!
//! Sequence: `begin_firmware_update` (button) -> `erase_pages` -> poll
//! `get_progress` until the erase reports `InvalidState` -> `write_flash`
//! per chunk -> `reset_device`. The image is validated and the erase set
//! computed before the first command is built.

use tracing::{debug, info};

use crate::payload::{FirmwareImage, FirmwareWriteCursor};
use crate::protocol::{Command, ProgressPhase, ProgressReport};

/// Where the update is in its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwarePhase {
    AwaitingConfirmation,
    Erasing,
    PollingErase,
    Writing,
    Resetting,
}

/// A running firmware update.
#[derive(Debug)]
pub struct FirmwareUpdateJob {
    image: FirmwareImage,
    erase_pages: Vec<u16>,
    cursor: FirmwareWriteCursor,
    phase: FirmwarePhase,
}

impl FirmwareUpdateJob {
    pub fn new(image: FirmwareImage) -> Self {
        let erase_pages = image.erase_pages();
        let cursor = FirmwareWriteCursor::new(&image);
        info!(
            pages = erase_pages.len(),
            bytes = image.total_bytes(),
            "Firmware update prepared"
        );
        Self {
            image,
            erase_pages,
            cursor,
            phase: FirmwarePhase::AwaitingConfirmation,
        }
    }

    pub fn phase(&self) -> FirmwarePhase {
        self.phase
    }

    pub fn erase_pages(&self) -> &[u16] {
        &self.erase_pages
    }

    pub fn cursor(&self) -> &FirmwareWriteCursor {
        &self.cursor
    }

    /// `(bytes written, total bytes)`.
    pub fn progress(&self) -> (u64, u64) {
        (self.cursor.total_bytes_written(), self.image.total_bytes())
    }

    pub fn start(&mut self) -> Command {
        self.phase = FirmwarePhase::AwaitingConfirmation;
        Command::BeginFirmwareUpdate
    }

    /// Button confirmed: erase every page the image touches.
    pub fn on_begin_confirmed(&mut self) -> Command {
        self.phase = FirmwarePhase::Erasing;
        Command::ErasePages {
            pages: self.erase_pages.clone(),
        }
    }

    /// Erase accepted: start polling it.
    pub fn on_erase_started(&mut self) -> Command {
        self.phase = FirmwarePhase::PollingErase;
        Command::GetProgress {
            since: 0,
            phase: ProgressPhase::ErasingPages,
        }
    }

    /// Erase still running.
    pub fn on_erase_progress(&mut self, report: &ProgressReport) -> Command {
        debug!(
            done = report.total_progress,
            total = report.total_progress_maximum,
            "Erasing pages"
        );
        Command::GetProgress {
            since: report.total_progress,
            phase: ProgressPhase::ErasingPages,
        }
    }

    /// Erase finished: first write, or straight to reset for an image with
    /// nothing to write.
    pub fn on_erase_complete(&mut self) -> Command {
        self.phase = FirmwarePhase::Writing;
        self.next_write()
    }

    /// Previous chunk written.
    pub fn on_chunk_written(&mut self) -> Command {
        self.cursor.acknowledge();
        self.next_write()
    }

    fn next_write(&mut self) -> Command {
        match self.cursor.next_chunk(&self.image) {
            Some((address, data)) => {
                debug!(address = format!("0x{:08X}", address), len = data.len(), "Writing flash");
                Command::WriteFlash { address, data }
            }
            None => {
                info!(bytes = self.cursor.total_bytes_written(), "Firmware written, resetting device");
                self.phase = FirmwarePhase::Resetting;
                Command::ResetDevice
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine, engine::general_purpose::STANDARD};

    fn image(size: usize) -> FirmwareImage {
        let json = format!(
            r#"{{"sections": {{"text": {{"lma": 134217728, "size": {}, "contents": "{}"}}}}}}"#,
            size,
            STANDARD.encode(vec![0x11u8; size])
        );
        FirmwareImage::from_json(json.as_bytes()).unwrap()
    }

    #[test]
    fn test_full_sequence() {
        let mut job = FirmwareUpdateJob::new(image(2500));
        assert_eq!(job.start(), Command::BeginFirmwareUpdate);
        assert_eq!(
            job.on_begin_confirmed(),
            Command::ErasePages {
                pages: vec![0, 1]
            }
        );
        assert_eq!(
            job.on_erase_started(),
            Command::GetProgress {
                since: 0,
                phase: ProgressPhase::ErasingPages
            }
        );
        let report = ProgressReport {
            total_progress: 1,
            total_progress_maximum: 2,
        };
        assert_eq!(
            job.on_erase_progress(&report),
            Command::GetProgress {
                since: 1,
                phase: ProgressPhase::ErasingPages
            }
        );

        let mut sizes = Vec::new();
        let mut next = job.on_erase_complete();
        while let Command::WriteFlash { data, .. } = &next {
            sizes.push(data.len());
            next = job.on_chunk_written();
        }
        assert_eq!(sizes, vec![1024, 1024, 452]);
        assert_eq!(next, Command::ResetDevice);
        assert_eq!(job.phase(), FirmwarePhase::Resetting);
        assert_eq!(job.progress(), (2500, 2500));
    }

    #[test]
    fn test_progress_counts_acknowledged_bytes() {
        let mut job = FirmwareUpdateJob::new(image(1500));
        job.start();
        job.on_begin_confirmed();
        job.on_erase_started();
        job.on_erase_complete();
        assert_eq!(job.progress(), (0, 1500));
        job.on_chunk_written();
        assert_eq!(job.progress(), (1024, 1500));
    }
}
