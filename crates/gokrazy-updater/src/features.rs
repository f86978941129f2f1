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

//! Update protocol feature negotiation
//!
//! Three device generations are in the field and none of them sends a version
//! number. They are told apart by the reply to `GET update/features`:
//!
//! | status | Content-Type   | generation                                   |
//! |--------|----------------|----------------------------------------------|
//! | 404    | any            | predates negotiation, no optional features   |
//! | 200    | `text/plain*`  | feature CSV; EEPROM fetched from `/` instead |
//! | 200    | anything else  | JSON with features and EEPROM                |
//!
//! Every other status is an error.

use crate::error::{Result, UpdateError};
use crate::transport::{
    DeviceRequest, DeviceResponse, HttpDoer, expect_ok, send, unexpected_status,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const JSON_MIME: &str = "application/json";

/// An optional part of the update protocol that older installations may lack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFeature {
    /// The bootloader config addresses partitions via `PARTUUID=`, so the
    /// device accepts root images that do the same.
    PartUuid,
    /// The device understands the `X-Gokrazy-Update-Hash` header with at
    /// least `crc32`.
    UpdateHash,
}

impl ProtocolFeature {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PartUuid => "partuuid",
            Self::UpdateHash => "updatehash",
        }
    }
}

impl fmt::Display for ProtocolFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signatures of the Raspberry Pi EEPROM files installed on the device
/// (`pieeprom.sig` and `vl805.sig`).
///
/// The values happen to be hex SHA256 sums, but treat them as opaque and only
/// compare them. Both are empty when the device did not tell us.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EepromVersion {
    #[serde(rename = "PieepromSHA256", default, deserialize_with = "null_as_default")]
    pub pieeprom_sha256: String,

    #[serde(rename = "VL805SHA256", default, deserialize_with = "null_as_default")]
    pub vl805_sha256: String,
}

impl EepromVersion {
    pub fn is_unknown(&self) -> bool {
        self.pieeprom_sha256.is_empty() && self.vl805_sha256.is_empty()
    }
}

/// Outcome of negotiation. Never changes once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    features: BTreeSet<String>,
    eeprom: EepromVersion,
}

impl Capabilities {
    pub fn new(features: &str, eeprom: EepromVersion) -> Self {
        Self {
            features: parse_features(features),
            eeprom,
        }
    }

    pub fn supports(&self, feature: ProtocolFeature) -> bool {
        self.features.contains(feature.as_str())
    }

    /// Every feature name the device reported, including ones this client
    /// does not know about.
    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(String::as_str)
    }

    pub fn eeprom(&self) -> &EepromVersion {
        &self.eeprom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceGeneration {
    PreNegotiation,
    PlainText,
    Json,
}

fn classify(response: &DeviceResponse) -> Result<DeviceGeneration> {
    match response.status {
        StatusCode::NOT_FOUND => Ok(DeviceGeneration::PreNegotiation),
        StatusCode::OK if response.content_type().starts_with("text/plain") => {
            Ok(DeviceGeneration::PlainText)
        }
        StatusCode::OK => Ok(DeviceGeneration::Json),
        _ => Err(unexpected_status(response)),
    }
}

/// Devices without EEPROM data send explicit `null`s, which mean the same as
/// a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct FeaturesResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    features: String,
    #[serde(rename = "EEPROM", default, deserialize_with = "null_as_default")]
    eeprom: EepromVersion,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(rename = "EEPROM", default, deserialize_with = "null_as_default")]
    eeprom: EepromVersion,
}

/// Ask the device which optional protocol features it supports.
///
/// `base_url` must end in `/`.
pub async fn negotiate(
    base_url: &str,
    doer: &dyn HttpDoer,
    cancel: &CancellationToken,
) -> Result<Capabilities> {
    let request = DeviceRequest::new(Method::GET, format!("{base_url}update/features"));
    let response = send(doer, request, cancel).await?;

    match classify(&response)? {
        DeviceGeneration::PreNegotiation => {
            debug!("Target has no update/features handler, assuming no optional features");
            Ok(Capabilities::default())
        }
        DeviceGeneration::PlainText => {
            let eeprom = match fetch_eeprom(base_url, doer, cancel).await {
                Ok(eeprom) => eeprom,
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) => {
                    warn!("could not get EEPROM version: {e}");
                    EepromVersion::default()
                }
            };
            Ok(Capabilities::new(&response.text(), eeprom))
        }
        DeviceGeneration::Json => {
            let parsed: FeaturesResponse = serde_json::from_slice(&response.body)?;
            Ok(Capabilities::new(&parsed.features, parsed.eeprom))
        }
    }
}

/// EEPROM version from the status page, for devices whose features handler
/// only speaks text/plain.
async fn fetch_eeprom(
    base_url: &str,
    doer: &dyn HttpDoer,
    cancel: &CancellationToken,
) -> Result<EepromVersion> {
    // Older status handlers key JSON output off Content-Type rather than Accept.
    let request = DeviceRequest::new(Method::GET, base_url)
        .header(CONTENT_TYPE, JSON_MIME)
        .header(ACCEPT, JSON_MIME);
    let response = send(doer, request, cancel).await?;
    expect_ok(&response)?;

    let content_type = response.content_type();
    if content_type != JSON_MIME {
        return Err(UpdateError::UnexpectedContentType {
            got: content_type.to_owned(),
            want: JSON_MIME.to_owned(),
        });
    }

    let status: StatusResponse = serde_json::from_slice(&response.body)?;
    Ok(status.eeprom)
}

fn parse_features(csv: &str) -> BTreeSet<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_owned)
        .collect()
}
