//! Completion translation: raw outcomes into typed replies.
//!
//! Both completion sources (driver transfers and clone children) converge
//! here; every failure becomes a [`FetchError`] delivered to the callback,
//! never a crash. Routing a completion to the wrong handler kind is a
//! programming-contract violation and treated as fatal.

use std::path::PathBuf;

use serde::Deserialize;

use quarry_fetch_core::driver::TransferOutcome;
use quarry_fetch_core::error::{FetchError, FetchResult};
use quarry_fetch_core::model::{CloneAction, CloneReply, Disposition, MetadataReply, PackageInfo, RawReply};
use quarry_fetch_core::reactor::ProcessStatus;

use crate::multiplexer::{CloneCallback, MetadataCallback, QueueHandle, RawCallback};

/// Raw completion signal routed to a handler.
pub(crate) enum Completion {
    /// Terminal transfer outcome from the driver.
    Transfer(TransferOutcome),
    /// Exit status of a clone child.
    Process(ProcessStatus),
    /// Synthesized failure (invalid input, spawn error, cancellation).
    Failed(FetchError),
}

/// Callback plus the context needed to type its completion.
pub(crate) enum ResponseHandler {
    Metadata(MetadataCallback),
    Raw(RawCallback),
    Clone {
        callback: CloneCallback,
        action: CloneAction,
        workdir: PathBuf,
    },
}

impl ResponseHandler {
    /// Translate the completion and invoke the callback exactly once.
    pub(crate) fn dispatch(
        self,
        completion: Completion,
        queue: &mut QueueHandle<'_>,
    ) -> Disposition {
        match self {
            Self::Metadata(callback) => callback(queue, metadata_reply(completion)),
            Self::Raw(callback) => callback(queue, raw_reply(completion)),
            Self::Clone {
                callback,
                action,
                workdir,
            } => callback(queue, clone_reply(completion, action, workdir)),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum EnvelopeStatus {
    Ok,
    Error,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    status: EnvelopeStatus,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    packages: Vec<PackageInfo>,
}

fn transfer_payload(completion: Completion) -> FetchResult<(u16, Vec<u8>)> {
    match completion {
        Completion::Transfer(TransferOutcome::Delivered { status, body }) => Ok((status, body)),
        Completion::Transfer(TransferOutcome::Failed(fault)) => Err(FetchError::Transport {
            kind: fault.kind,
            detail: fault.detail,
        }),
        Completion::Failed(error) => Err(error),
        Completion::Process(_) => unreachable!("process completion routed to a transfer handler"),
    }
}

fn metadata_reply(completion: Completion) -> FetchResult<MetadataReply> {
    let (status, body) = transfer_payload(completion)?;
    if !(200..300).contains(&status) {
        return Err(FetchError::HttpStatus { status });
    }
    let envelope: RpcEnvelope =
        serde_json::from_slice(&body).map_err(|source| FetchError::Parse { source })?;
    match envelope.status {
        EnvelopeStatus::Ok => Ok(MetadataReply {
            packages: envelope.packages,
        }),
        EnvelopeStatus::Error => Err(FetchError::Service {
            message: envelope
                .error
                .unwrap_or_else(|| "unspecified repository error".to_owned()),
        }),
    }
}

fn raw_reply(completion: Completion) -> FetchResult<RawReply> {
    let (status, body) = transfer_payload(completion)?;
    if !(200..300).contains(&status) {
        return Err(FetchError::HttpStatus { status });
    }
    Ok(RawReply { status, body })
}

fn clone_reply(
    completion: Completion,
    action: CloneAction,
    workdir: PathBuf,
) -> FetchResult<CloneReply> {
    match completion {
        Completion::Process(status) if status.success() => Ok(CloneReply { action, workdir }),
        Completion::Process(status) => Err(FetchError::Process { status }),
        Completion::Failed(error) => Err(error),
        Completion::Transfer(_) => unreachable!("transfer completion routed to the clone handler"),
    }
}
