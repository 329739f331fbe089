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

//! Content digests for CAS blobs and REAPI messages.
//!
//! The hash function is process-wide configuration; everything that computes
//! a digest goes through a [`DigestFunction`] picked once at startup.

use md5::Md5;
use prost::Message;
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::errors::*;
use crate::proto;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestFunction {
    Sha256,
    Sha384,
    Sha512,
    Md5,
}

pub const SUPPORTED_FUNCTIONS: &[DigestFunction] = &[
    DigestFunction::Sha256,
    DigestFunction::Sha384,
    DigestFunction::Sha512,
    DigestFunction::Md5,
];

impl Default for DigestFunction {
    fn default() -> Self {
        DigestFunction::Sha256
    }
}

impl fmt::Display for DigestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DigestFunction::Sha256 => "SHA256",
            DigestFunction::Sha384 => "SHA384",
            DigestFunction::Sha512 => "SHA512",
            DigestFunction::Md5 => "MD5",
        };
        f.write_str(name)
    }
}

impl FromStr for DigestFunction {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, ConfigError> {
        match s.to_ascii_uppercase().as_str() {
            "SHA256" => Ok(DigestFunction::Sha256),
            "SHA384" => Ok(DigestFunction::Sha384),
            "SHA512" => Ok(DigestFunction::Sha512),
            "MD5" => Ok(DigestFunction::Md5),
            _ => Err(ConfigError(format!(
                "unknown digest function \"{}\" (supported: {})",
                s,
                supported_functions_list()
            ))),
        }
    }
}

pub fn supported_functions_list() -> String {
    SUPPORTED_FUNCTIONS
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl DigestFunction {
    pub fn make_digest(&self, data: &[u8]) -> proto::Digest {
        let hash = match self {
            DigestFunction::Sha256 => hex::encode(Sha256::digest(data)),
            DigestFunction::Sha384 => hex::encode(Sha384::digest(data)),
            DigestFunction::Sha512 => hex::encode(Sha512::digest(data)),
            DigestFunction::Md5 => hex::encode(Md5::digest(data)),
        };
        proto::Digest {
            hash,
            size_bytes: data.len() as i64,
        }
    }

    /// Digest of a message's canonical (tag-ordered) serialization.
    pub fn make_digest_of_message<M: Message>(&self, message: &M) -> proto::Digest {
        self.make_digest(&message.encode_to_vec())
    }
}
