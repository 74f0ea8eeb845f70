/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

/// Errors reported by the stack collection APIs.
///
/// Per-thread failures inside a snapshot are recorded in the snapshot
/// entries instead of failing the snapshot as a whole.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform lacks required primitives, or the stack trace signal
    /// handler could not be installed because another handler owns the
    /// signal.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The requested signal number could not be installed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Signal delivery failed; the target thread has likely exited.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// The deadline elapsed before the target thread picked up the signal.
    #[error("timed out: {0}")]
    TimedOut(&'static str),

    /// A debugger or tracer is attached; collection refused.
    #[error("incomplete: {0}")]
    Incomplete(&'static str),

    /// Thread enumeration failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
