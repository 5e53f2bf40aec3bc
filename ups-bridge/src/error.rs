//! Error taxonomy for the bridge
//!
//! Transport and protocol errors are recovered where they happen (reconnect,
//! wait for more bytes). Auth and upstream errors abort the single workflow
//! that hit them. Only discovery timeout and config errors reach `main`.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// UDP/TCP failure while discovering or talking to the detector
    #[error("transport error while {context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Inbound bytes that can never become a status frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credential rejected even after a forced refresh
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Non-2xx answer from the cloud API
    #[error("upstream {method} {url} failed with {status}: {body}")]
    Upstream {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    /// Request never produced a response (connect error, timeout, bad body)
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid notification template: {0}")]
    InvalidTemplate(String),

    #[error("no detector answered discovery within {0:?}")]
    DiscoveryTimeout(std::time::Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn transport(context: &'static str, source: io::Error) -> Self {
        BridgeError::Transport { context, source }
    }

    /// True for failures the caller should retry later rather than report
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::Transport { .. } | BridgeError::Http(_) | BridgeError::Upstream { .. }
        )
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
