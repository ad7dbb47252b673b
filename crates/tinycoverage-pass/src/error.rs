// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use thiserror::Error;

/// Failure while emitting the sidecar notes file.
///
/// Notes failures never abort instrumentation: the driver logs them and
/// records the outcome in [`RunSummary`](crate::RunSummary). Coverage
/// without notes is degraded but functional.
#[derive(Debug, Error)]
pub enum NotesError {
    #[error("cannot create notes file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write notes file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
