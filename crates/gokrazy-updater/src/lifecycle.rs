// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Partition switching and reboots
//!
//! None of these commands are idempotent: calling `switch` twice flips the
//! active partition back. Ordering is entirely up to the caller.

use crate::error::Result;
use crate::target::Target;
use crate::transport::{DeviceRequest, expect_ok};
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::info;

impl Target {
    /// Make the currently inactive root partition the active one.
    pub async fn switch(&self, cancel: &CancellationToken) -> Result<()> {
        self.command("update/switch", cancel).await
    }

    /// Mark the inactive root partition to be tested upon the next boot, and
    /// made active if the test boot succeeds.
    pub async fn testboot(&self, cancel: &CancellationToken) -> Result<()> {
        self.command("update/testboot", cancel).await
    }

    /// Reboot the device, picking up the updated partitions.
    pub async fn reboot(&self, cancel: &CancellationToken) -> Result<()> {
        self.command("reboot", cancel).await
    }

    /// Reboot without kexec, going through firmware and bootloader. Useful in
    /// CI to make sure the bootloader gets exercised too.
    pub async fn reboot_without_kexec(&self, cancel: &CancellationToken) -> Result<()> {
        self.command("reboot?kexec=off", cancel).await
    }

    async fn command(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        let response = self
            .send(DeviceRequest::new(Method::POST, self.url(path)), cancel)
            .await?;
        expect_ok(&response)?;
        info!("{path}: done");
        Ok(())
    }
}
