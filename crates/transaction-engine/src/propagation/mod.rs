// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod carrier;
pub mod cat;
pub mod distributed_trace;
pub mod error;
pub mod path_hash;
