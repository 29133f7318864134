// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

pub mod digest;
pub mod fs;
pub mod jitter;
