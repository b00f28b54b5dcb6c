// Copyright 2026 Fanout Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Fanout CLI
//!
//! Command-line runner for the fanout dispatch engine.
//!
//! ## Key Commands
//!
//! - `fanout run`: dispatch records from a JSON Lines file (or synthetic
//!   records) to an HTTP endpoint or a simulated one, printing the summary
//!   as JSON
//! - `fanout check`: validate settings and scan an input file without
//!   invoking anything

pub mod simulate;

pub use simulate::{SimulatedTransport, SimulationProfile};
