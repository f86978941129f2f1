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

//! Error types for the updater crate

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("request cancelled")]
    Cancelled,

    #[error("unexpected HTTP status code: got {status}, want {want} (body {body:?})")]
    UnexpectedStatus {
        status: StatusCode,
        want: StatusCode,
        body: String,
    },

    #[error("unexpected Content-Type: got {got:?}, want {want:?}")]
    UnexpectedContentType { got: String, want: String },

    /// The device answered an upload with an HTML page: this destination is
    /// not implemented by its firmware. Callers may choose to carry on.
    #[error("update handler not implemented")]
    HandlerNotImplemented,

    #[error("unexpected checksum: got {got}, want {want}")]
    ChecksumMismatch { got: String, want: String },

    #[error("decoding reported checksum: {0}")]
    InvalidDigest(#[from] hex::FromHexError),

    #[error("decoding response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}; try upgrading")]
    UpgradeRequired(String),

    #[error("/uploadtemp/ handler not found, is your gokrazy installation too old?")]
    UploadTempNotFound,

    #[error("invalid target URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    pub(crate) fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_handler_not_implemented(&self) -> bool {
        matches!(self, Self::HandlerNotImplemented)
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
