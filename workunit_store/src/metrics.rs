// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use strum_macros::IntoStaticStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Metric {
    LocalCacheRequests,
    LocalCacheRequestsCached,
    LocalCacheRequestsUncached,
    LocalCacheReadErrors,
    LocalCacheWriteErrors,
    LocalCacheTotalTimeSavedMs,
    LocalExecutionRequests,
    LocalProcessTotalTimeRunMs,
    RemoteExecutionRequests,
    RemoteExecutionErrors,
    RemoteExecutionSuccess,
    RemoteExecutionTimeouts,
    RemoteProcessTotalTimeRunMs,
    RemoteStoreMissingDigest,
    RemoteStoreRequestTimeouts,
    BacktrackAttempts,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ObservationMetric {
    LocalCacheTimeSavedMs,
    LocalStoreReadBlobSize,
    LocalProcessTimeRunMs,
    RemoteProcessTimeRunMs,
    RemoteStoreTimeToFirstByteMicros,
}
