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

//! In-process fake device for unit tests

use crate::error::{Result, UpdateError};
use crate::transport::{DeviceRequest, DeviceResponse, HttpDoer};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

type Handler = Arc<dyn Fn(&RecordedRequest, &[u8]) -> DeviceResponse + Send + Sync>;

/// Drains every request body and answers through `handler`. Clones share
/// the request log, so a test can keep one while the target owns another.
#[derive(Clone)]
pub struct FakeDevice {
    handler: Handler,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FakeDevice {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest, &[u8]) -> DeviceResponse + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A device without feature negotiation that answers 200 with an empty
    /// body to everything else.
    pub fn ok() -> Self {
        Self::new(|req, _body| {
            if req.url.ends_with("update/features") {
                DeviceResponse::new(StatusCode::NOT_FOUND, "404 page not found")
            } else {
                DeviceResponse::new(StatusCode::OK, "")
            }
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpDoer for FakeDevice {
    async fn execute(&self, request: DeviceRequest) -> Result<DeviceResponse> {
        let body = request
            .body
            .into_bytes()
            .await
            .map_err(UpdateError::transport)?;
        let recorded = RecordedRequest {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body,
        };
        let response = (self.handler)(&recorded, &recorded.body);
        self.requests.lock().push(recorded);
        Ok(response)
    }
}
