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

//! Streaming image uploads with end-to-end checksum verification

use crate::checksum::{Checksum, UPDATE_HASH_HEADER, UpdateHash};
use crate::error::{Result, UpdateError};
use crate::features::ProtocolFeature;
use crate::target::Target;
use crate::transport::{BodyStream, DeviceRequest, RequestBody, expect_ok, unexpected_status};
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use reqwest::header::HeaderName;
use reqwest::{Method, StatusCode};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

const HTML_DOCTYPE: &[u8] = b"<!DOCTYPE html>";

/// Where an image is written on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Raw write onto the root block device, for BIOS-booting PCs.
    Mbr,
    /// The currently inactive root partition.
    Root,
    /// The boot partition.
    Boot,
    /// The boot partition, keeping the currently active root active. For
    /// updating boot without also updating root.
    BootOnly,
}

impl Destination {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mbr => "mbr",
            Self::Root => "root",
            Self::Boot => "boot",
            Self::BootOnly => "bootonly",
        }
    }
}

impl AsRef<str> for Destination {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mbr" => Ok(Self::Mbr),
            "root" => Ok(Self::Root),
            "boot" => Ok(Self::Boot),
            "bootonly" => Ok(Self::BootOnly),
            other => Err(format!("unknown destination {other:?}")),
        }
    }
}

#[derive(Debug)]
struct Transferred {
    checksum: Checksum,
    bytes: u64,
}

/// Wrap `reader` so every chunk handed to the transport also feeds `state`.
fn hashing_stream<R>(reader: R, state: Arc<Mutex<Transferred>>) -> BodyStream
where
    R: AsyncRead + Send + 'static,
{
    ReaderStream::new(reader)
        .inspect_ok(move |chunk| {
            let mut state = state.lock();
            state.checksum.update(chunk);
            state.bytes += chunk.len() as u64;
        })
        .boxed()
}

/// Check the digest the device reported against the one computed locally.
fn verify_reported_digest(reported: &[u8], local: &[u8]) -> Result<()> {
    if reported.len() >= HTML_DOCTYPE.len()
        && reported[..HTML_DOCTYPE.len()].eq_ignore_ascii_case(HTML_DOCTYPE)
    {
        return Err(UpdateError::HandlerNotImplemented);
    }

    let decoded = hex::decode(reported.trim_ascii())?;
    if decoded != local {
        return Err(UpdateError::ChecksumMismatch {
            got: hex::encode(decoded),
            want: hex::encode(local),
        });
    }
    Ok(())
}

impl Target {
    /// Digest used for uploads to this target.
    pub fn update_hash(&self) -> UpdateHash {
        if self.supports(ProtocolFeature::UpdateHash) {
            UpdateHash::Crc32
        } else {
            UpdateHash::Sha256
        }
    }

    /// Stream `reader` to `destination` on the device and verify the digest
    /// the device computed over what it received.
    ///
    /// The reader is consumed completely. There is exactly one attempt;
    /// [`UpdateError::HandlerNotImplemented`] means the firmware lacks this
    /// destination (e.g. `mbr` on older devices) and the caller may decide to
    /// carry on. Wrap the reader to observe progress.
    pub async fn stream_to<R>(
        &self,
        destination: impl AsRef<str>,
        reader: R,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Send + 'static,
    {
        let destination = destination.as_ref();
        let algorithm = self.update_hash();
        let state = Arc::new(Mutex::new(Transferred {
            checksum: algorithm.hasher(),
            bytes: 0,
        }));

        let mut request = DeviceRequest::new(Method::PUT, self.url(&format!("update/{destination}")))
            .body(RequestBody::Stream(hashing_stream(reader, Arc::clone(&state))));
        if let Some(value) = algorithm.header_value() {
            request = request.header(HeaderName::from_static(UPDATE_HASH_HEADER), value);
        }

        let response = self.send(request, cancel).await?;
        expect_ok(&response)?;

        let (local, bytes) = {
            let state = state.lock();
            (state.checksum.digest(), state.bytes)
        };
        verify_reported_digest(&response.body, &local)?;

        info!(
            "Uploaded {bytes} bytes to {destination} ({algorithm:?} {})",
            hex::encode(&local)
        );
        Ok(())
    }

    /// Stream `reader` to an arbitrary `path` without checksum verification.
    ///
    /// Not suited for updating the system, use [`Target::stream_to`] for that.
    /// Meant for the `uploadtemp/` handler that backs diversions.
    pub async fn put<R>(&self, path: &str, reader: R, cancel: &CancellationToken) -> Result<()>
    where
        R: AsyncRead + Send + 'static,
    {
        let body = ReaderStream::new(reader).boxed();
        let request = DeviceRequest::new(Method::PUT, self.url(path.trim_start_matches('/')))
            .body(RequestBody::Stream(body));

        let response = self.send(request, cancel).await?;
        match response.status {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(UpdateError::UploadTempNotFound),
            _ => Err(unexpected_status(&response)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hex_digest;
    use crate::testutil::FakeDevice;
    use crate::transport::{DeviceResponse, HttpDoer};
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::time::Duration;

    async fn target_with(features: &'static str, device: FakeDevice) -> Target {
        // Feature negotiation is answered here; everything else goes to `device`.
        let doer = Negotiated { features, device };
        Target::new("http://gokrazy/", doer, &CancellationToken::new())
            .await
            .unwrap()
    }

    struct Negotiated {
        features: &'static str,
        device: FakeDevice,
    }

    #[async_trait]
    impl HttpDoer for Negotiated {
        async fn execute(&self, request: DeviceRequest) -> Result<DeviceResponse> {
            if request.url.ends_with("update/features") {
                return Ok(DeviceResponse::new(
                    StatusCode::OK,
                    format!(r#"{{"features":"{}"}}"#, self.features),
                )
                .with_content_type("application/json"));
            }
            self.device.execute(request).await
        }
    }

    /// Device that hashes what it received with the algorithm it was asked for.
    fn honest_device() -> FakeDevice {
        FakeDevice::new(|req, body| {
            let algorithm = match req.headers.get(UPDATE_HASH_HEADER) {
                Some(v) if v == "crc32" => UpdateHash::Crc32,
                _ => UpdateHash::Sha256,
            };
            DeviceResponse::new(StatusCode::OK, hex_digest(algorithm, body))
        })
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_stream_to_sha256_by_default() {
        let target = target_with("partuuid", honest_device()).await;
        assert_eq!(target.update_hash(), UpdateHash::Sha256);

        for len in [0, 1, 4096, 300_000] {
            let data = payload(len);
            target
                .stream_to(Destination::Root, Cursor::new(data), &CancellationToken::new())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_stream_to_crc32_with_updatehash() {
        let target = target_with("partuuid,updatehash", honest_device()).await;
        assert_eq!(target.update_hash(), UpdateHash::Crc32);

        target
            .stream_to(Destination::Boot, Cursor::new(payload(300_000)), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_to_sends_expected_request() {
        let device = honest_device();
        let target = target_with("updatehash", device.clone()).await;
        let data = payload(1000);
        target
            .stream_to(Destination::Mbr, Cursor::new(data.clone()), &CancellationToken::new())
            .await
            .unwrap();

        let requests = device.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::PUT);
        assert_eq!(requests[0].url, "http://gokrazy/update/mbr");
        assert_eq!(requests[0].headers[UPDATE_HASH_HEADER], "crc32");
        assert_eq!(requests[0].body.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_stream_to_sha256_sends_no_hash_header() {
        let device = honest_device();
        let target = target_with("", device.clone()).await;
        target
            .stream_to("root", Cursor::new(b"abc".to_vec()), &CancellationToken::new())
            .await
            .unwrap();

        assert!(device.requests()[0].headers.get(UPDATE_HASH_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_stream_to_detects_corruption() {
        for features in ["", "updatehash"] {
            let device = FakeDevice::new(|req, body| {
                let algorithm = match req.headers.get(UPDATE_HASH_HEADER) {
                    Some(_) => UpdateHash::Crc32,
                    None => UpdateHash::Sha256,
                };
                let mut received = body.to_vec();
                received[17] ^= 0x01;
                DeviceResponse::new(StatusCode::OK, hex_digest(algorithm, &received))
            });
            let target = target_with(features, device).await;

            let err = target
                .stream_to(Destination::Root, Cursor::new(payload(64)), &CancellationToken::new())
                .await
                .unwrap_err();
            match err {
                UpdateError::ChecksumMismatch { got, want } => {
                    assert_ne!(got, want);
                    assert_eq!(want, hex_digest(target.update_hash(), &payload(64)));
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_stream_to_html_is_not_implemented() {
        let device = FakeDevice::new(|_req, _body| {
            DeviceResponse::new(
                StatusCode::OK,
                "<!DOCTYPE html>\n<html><body>gokrazy</body></html>",
            )
        });
        let target = target_with("", device).await;

        let err = target
            .stream_to(Destination::Mbr, Cursor::new(payload(10)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_handler_not_implemented());
    }

    #[tokio::test]
    async fn test_stream_to_rejects_non_hex_reply() {
        let device = FakeDevice::new(|_req, _body| DeviceResponse::new(StatusCode::OK, "zz"));
        let target = target_with("", device).await;

        let err = target
            .stream_to(Destination::Root, Cursor::new(payload(10)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::InvalidDigest(_)));
    }

    #[tokio::test]
    async fn test_stream_to_unexpected_status() {
        let device = FakeDevice::new(|_req, _body| {
            DeviceResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "no space left on device\n")
        });
        let target = target_with("", device).await;

        let err = target
            .stream_to(Destination::Root, Cursor::new(payload(10)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::UnexpectedStatus { status: StatusCode::INTERNAL_SERVER_ERROR, ref body, .. }
                if body == "no space left on device"
        ));
    }

    #[tokio::test]
    async fn test_stream_to_tolerates_trailing_newline() {
        let device = FakeDevice::new(|_req, body| {
            DeviceResponse::new(
                StatusCode::OK,
                format!("{}\n", hex_digest(UpdateHash::Sha256, body)),
            )
        });
        let target = target_with("", device).await;

        target
            .stream_to(Destination::Root, Cursor::new(payload(10)), &CancellationToken::new())
            .await
            .unwrap();
    }

    /// Pulls the first chunk of the body, then hangs like a stalled link.
    struct StalledDevice;

    #[async_trait]
    impl HttpDoer for StalledDevice {
        async fn execute(&self, request: DeviceRequest) -> Result<DeviceResponse> {
            if request.url.ends_with("update/features") {
                return Ok(DeviceResponse::new(StatusCode::NOT_FOUND, ""));
            }
            if let RequestBody::Stream(mut stream) = request.body {
                let _ = stream.next().await;
            }
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stream_to_cancelled_mid_upload() {
        let target = Target::new("http://gokrazy/", StalledDevice, &CancellationToken::new())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = target
            .stream_to(Destination::Root, Cursor::new(payload(300_000)), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_put_streams_without_verification() {
        let device = FakeDevice::ok();
        let target = target_with("", device.clone()).await;
        target
            .put("uploadtemp/hello", Cursor::new(b"binary".to_vec()), &CancellationToken::new())
            .await
            .unwrap();

        let requests = device.requests();
        assert_eq!(requests[0].method, Method::PUT);
        assert_eq!(requests[0].url, "http://gokrazy/uploadtemp/hello");
        assert_eq!(requests[0].body.as_ref(), b"binary");
    }

    #[tokio::test]
    async fn test_put_not_found_means_old_installation() {
        let device = FakeDevice::new(|_req, _body| DeviceResponse::new(StatusCode::NOT_FOUND, ""));
        let target = target_with("", device).await;

        let err = target
            .put("/uploadtemp/hello", Cursor::new(Vec::new()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::UploadTempNotFound));
    }

    #[test]
    fn test_destination_parse() {
        for dest in [
            Destination::Mbr,
            Destination::Root,
            Destination::Boot,
            Destination::BootOnly,
        ] {
            assert_eq!(dest.as_str().parse::<Destination>().unwrap(), dest);
        }
        assert!("swap".parse::<Destination>().is_err());
    }
}
