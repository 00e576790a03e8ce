// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Warnings are errors when building on CI.
#![cfg_attr(not(debug_assertions), deny(warnings))]

mod error;

pub(crate) use error::Result;
pub use error::{Error, ErrorKind};

pub mod query;

/// The version of the query executor.
pub static VERSION: &str = env!("CARGO_PKG_VERSION");
