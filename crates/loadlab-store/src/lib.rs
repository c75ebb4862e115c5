// Copyright (c) 2025 LoadLab Team
// SPDX-License-Identifier: Apache-2.0

//! CSV-backed persistence for experiment samples.
//!
//! One `{guid}.csv` file per experiment, written live by the store's sample
//! handler and read back for the experiment list and sample retrieval. Only
//! the scalar sample columns are persisted; the per-command map is not.

mod csv_store;

pub use csv_store::{csv_string, CsvStore, CSV_HEADER};
