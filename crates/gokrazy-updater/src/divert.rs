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

//! Service diversions: run a temporarily uploaded binary instead of the
//! installed one

use crate::error::{Result, UpdateError};
use crate::target::Target;
use crate::transport::{DeviceRequest, RequestBody, expect_ok};
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DivertRequest<'a> {
    path: &'a str,
    diversion: &'a str,
    flags: Vec<&'a str>,
}

impl Target {
    /// Make the device run `diversion` (a file previously uploaded with
    /// [`Target::put`]) instead of the installed binary `path`, restarting
    /// the service.
    ///
    /// `service_flags` are the flags the service was installed with;
    /// `extra_flags` are appended after them. Devices that predate the JSON
    /// request format cannot take flags at all: with non-empty `extra_flags`
    /// they fail with [`UpdateError::UpgradeRequired`], otherwise the request
    /// is retried once in the old query-parameter format.
    pub async fn divert(
        &self,
        path: &str,
        diversion: &str,
        service_flags: &[String],
        extra_flags: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let body = DivertRequest {
            path,
            diversion,
            flags: service_flags
                .iter()
                .chain(extra_flags)
                .map(String::as_str)
                .collect(),
        };
        let request = DeviceRequest::new(Method::POST, self.url("divert"))
            .header(CONTENT_TYPE, "application/json")
            .body(RequestBody::Bytes(Bytes::from(serde_json::to_vec(&body)?)));

        let mut response = self.send(request, cancel).await?;
        if response.status == StatusCode::BAD_REQUEST {
            if !extra_flags.is_empty() {
                return Err(UpdateError::UpgradeRequired(
                    "running version of gokrazy does not support command line arguments"
                        .to_owned(),
                ));
            }
            debug!("divert: JSON request rejected, retrying with query parameters");
            let url = format!(
                "{}?diversion={}&path={}",
                self.url("divert"),
                urlencoding::encode(diversion),
                urlencoding::encode(path)
            );
            response = self.send(DeviceRequest::new(Method::POST, url), cancel).await?;
        }
        expect_ok(&response)?;

        info!("Diverted {path} to {diversion}");
        Ok(())
    }
}
