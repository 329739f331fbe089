// Copyright 2021 rexc project contributors
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

//! rexc: a transparent remote-execution wrapper for C/C++ compiler
//! invocations.
//!
//! Prefix a compile command with `rexc` and it is parsed into a
//! content-addressed Remote Execution API Action, probed against the Action
//! Cache, and executed remotely on a miss. Commands rexc cannot fully
//! understand run locally, so a build never regresses by being wrapped.

#[macro_use]
extern crate log;

pub mod actionbuilder;
pub mod compiler;
pub mod config;
pub mod deps;
pub mod digest;
pub mod errors;
pub mod execution;
pub mod metrics;
pub mod paths;
pub mod proto;
pub mod remote;
pub mod subprocess;

#[cfg(test)]
mod test;
