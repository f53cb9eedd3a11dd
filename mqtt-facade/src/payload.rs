// Copyright 2025 The Drasi Authors.
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

//! Payload normalization: bytes pass through, text is encoded as UTF-8 and
//! anything else goes through `serde_json` via the [`Json`] wrapper.

use serde::Serialize;

use crate::error::Result;

/// Conversion of a publishable value into the bytes sent on the wire.
pub trait IntoPayload {
    fn into_payload(self) -> Result<Vec<u8>>;
}

/// Structured payload, serialized to JSON when published.
///
/// ```ignore
/// client.publish("sensors/1", Json(&reading)).await?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Json<T>(pub T);

impl<T: Serialize> IntoPayload for Json<T> {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

impl IntoPayload for Vec<u8> {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self)
    }
}

impl IntoPayload for &Vec<u8> {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }
}

impl IntoPayload for &[u8] {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl<const N: usize> IntoPayload for [u8; N] {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl<const N: usize> IntoPayload for &[u8; N] {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl IntoPayload for String {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.into_bytes())
    }
}

impl IntoPayload for &String {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

impl IntoPayload for &str {
    fn into_payload(self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}
