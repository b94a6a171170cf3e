//! Firmware update sequence over a connected session.
//!
//! Every step goes through the session's command queue and waits for its
//! acknowledgment before the next one starts:
//!
//! 1. read the version list and pick sections
//! 2. start-of-update with the total byte count
//! 3. every packet of every selected section
//! 4. OTA mode switch, version update, reboot

use super::firmware::{FirmwareFile, total_transfer_len};
use crate::command::{GetVersionList, OtaFailed, OtaStart, Reboot, SendOtaData, SetOtaMode, SetVersion};
use crate::config::OtaConfig;
use crate::error::{Result, XrError};
use crate::framer::OtaDataFramer;
use crate::session::{ConnectionState, DeviceSession};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum OtaState {
    #[default]
    Idle,
    Updating,
    Completed,
    Failed(String),
}

struct Shared {
    session: DeviceSession,
    config: OtaConfig,
    state: watch::Sender<OtaState>,
    progress: watch::Sender<f32>,
}

#[derive(Clone)]
pub struct OtaUpdater {
    shared: Arc<Shared>,
}

impl OtaUpdater {
    pub fn new(session: DeviceSession, config: OtaConfig) -> Self {
        let (state, _) = watch::channel(OtaState::Idle);
        let (progress, _) = watch::channel(0.0);
        Self {
            shared: Arc::new(Shared {
                session,
                config,
                state,
                progress,
            }),
        }
    }

    pub fn state(&self) -> watch::Receiver<OtaState> {
        self.shared.state.subscribe()
    }

    /// Fraction of data packets acknowledged, 0.0 to 1.0.
    pub fn progress(&self) -> watch::Receiver<f32> {
        self.shared.progress.subscribe()
    }

    pub async fn update(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let file = match FirmwareFile::parse(bytes) {
            Ok(file) => file,
            Err(e) => {
                self.shared.state.send_replace(OtaState::Failed(e.to_string()));
                return Err(e);
            }
        };
        self.update_file(&file).await
    }

    /// Runs the whole sequence. The state ends in `Completed` or `Failed`.
    pub async fn update_file(&self, file: &FirmwareFile) -> Result<()> {
        self.shared.state.send_replace(OtaState::Updating);
        self.shared.progress.send_replace(0.0);
        match self.run(file).await {
            Ok(()) => {
                self.shared.progress.send_replace(1.0);
                self.shared.state.send_replace(OtaState::Completed);
                info!("update completed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "update failed");
                self.shared.state.send_replace(OtaState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Runs [`update_file`](Self::update_file) on its own task.
    pub fn start(&self, file: FirmwareFile) -> OtaHandle {
        let cancel = CancellationToken::new();
        let updater = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                result = updater.update_file(&file) => result,
                _ = token.cancelled() => {
                    updater.abandon().await;
                    Err(XrError::Cancelled)
                }
            }
        });
        OtaHandle { cancel, task }
    }

    /// Drops what is left of the transfer and tells the glasses.
    async fn abandon(&self) {
        info!("update cancelled");
        let session = &self.shared.session;
        session.clear_commands();
        if let Err(e) = session.execute(OtaFailed).await {
            debug!(error = %e, "cancel notification not acknowledged");
        }
        self.shared.state.send_replace(OtaState::Idle);
    }

    async fn run(&self, file: &FirmwareFile) -> Result<()> {
        let session = &self.shared.session;
        if session.current_state() != ConnectionState::Connected {
            return Err(XrError::NotConnected);
        }

        let versions = session.execute(GetVersionList).await?;
        debug!(?versions, "device versions");
        let selected = file.select_sections(&versions, self.shared.config.force_update);
        if selected.is_empty() {
            info!("firmware already up to date");
            return Ok(());
        }

        let total = total_transfer_len(&selected);
        let total = u32::try_from(total).map_err(|_| XrError::Ota(format!("update too large: {total} bytes")))?;
        info!(sections = selected.len(), total, version = file.header.version, "starting update");
        session.execute(OtaStart(total)).await?;
        tokio::time::sleep(self.shared.config.start_settle_delay).await;

        let mtu = session.mtu();
        let framers: Vec<_> = selected
            .iter()
            .map(|s| OtaDataFramer::new(s.bin_type(), s.full_data(), mtu))
            .collect();
        let packets: usize = framers.iter().map(OtaDataFramer::packet_count).sum();

        let mut sent = 0usize;
        for framer in &framers {
            debug!(bin_type = framer.bin_type(), packets = framer.packet_count(), "sending section");
            for (index, packet) in framer.packets().enumerate() {
                session.execute(SendOtaData::new(packet, index as u32)).await.map_err(|e| {
                    XrError::Ota(format!(
                        "packet {index} of section {:#04x} not acknowledged: {e}",
                        framer.bin_type()
                    ))
                })?;
                sent += 1;
                self.shared.progress.send_replace(sent as f32 / packets as f32);
            }
        }

        session.execute(SetOtaMode).await?;
        session.execute(SetVersion(file.header.version)).await?;
        // The glasses drop the link while rebooting; a missing ack is expected.
        if let Err(e) = session.execute(Reboot).await {
            debug!(error = %e, "reboot not acknowledged");
        }
        Ok(())
    }
}

/// A running update started with [`OtaUpdater::start`].
pub struct OtaHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl OtaHandle {
    /// Stops the update and notifies the glasses. The updater returns to `Idle`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| XrError::Ota(format!("update task failed: {e}")))?
    }
}
