// Networked RAID-5 block storage array driven by a poll reactor.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Generic "file-form" encoding of small key-value records (`key=value` lines) and the records
//! carried in it: disk info and backend login details.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::ServiceError;

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum FormError {
    /// form is not valid UTF-8.
    NotUtf8,

    /// line `{0}` has no `=` separator.
    NoSeparator(String),

    /// line `{0}` has an empty key.
    EmptyKey(String),

    /// key `{0}` is repeated.
    DuplicateKey(String),

    /// key `{0}` is missing.
    MissingKey(String),

    /// key `{0}` has invalid value.
    InvalidValue(String),
}

impl From<FormError> for ServiceError {
    fn from(err: FormError) -> Self { ServiceError::InvalidArguments(err.to_string()) }
}

#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Form(BTreeMap<String, String>);

impl Form {
    pub fn new() -> Self { Form::default() }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl ToString) {
        self.0.insert(key.to_owned(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> { self.0.get(key).map(String::as_str) }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Reads a mandatory key and parses its value.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<T, FormError> {
        self.get(key)
            .ok_or_else(|| FormError::MissingKey(key.to_owned()))?
            .parse()
            .map_err(|_| FormError::InvalidValue(key.to_owned()))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = String::new();
        for (key, value) in &self.0 {
            buf.push_str(key);
            buf.push('=');
            buf.push_str(value);
            buf.push('\n');
        }
        buf.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormError> {
        let text = std::str::from_utf8(bytes).map_err(|_| FormError::NotUtf8)?;
        let mut form = Form::new();
        // A missing final newline is tolerated
        for line in text.lines().filter(|line| !line.is_empty()) {
            let (key, value) =
                line.split_once('=').ok_or_else(|| FormError::NoSeparator(line.to_owned()))?;
            if key.is_empty() {
                return Err(FormError::EmptyKey(line.to_owned()));
            }
            if form.0.insert(key.to_owned(), value.to_owned()).is_some() {
                return Err(FormError::DuplicateKey(key.to_owned()));
            }
        }
        Ok(form)
    }
}

/// Metadata each backend keeps next to its blocks, describing its place in the array.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DiskInfo {
    /// Identifier of the array generated by a scratch initialization.
    pub array: u64,
    pub index: usize,
    /// Generation level: bumped on the surviving disks whenever a disk drops out of the array.
    pub level: u64,
    /// Total number of disks in the array, parity included.
    pub disks: usize,
    pub block_size: usize,
    pub blocks: u64,
}

impl DiskInfo {
    pub fn to_form(&self) -> Form {
        Form::new()
            .with("array", self.array)
            .with("index", self.index)
            .with("level", self.level)
            .with("disks", self.disks)
            .with("block_size", self.block_size)
            .with("blocks", self.blocks)
    }

    pub fn from_form(form: &Form) -> Result<Self, FormError> {
        Ok(DiskInfo {
            array: form.parse("array")?,
            index: form.parse("index")?,
            level: form.parse("level")?,
            disks: form.parse("disks")?,
            block_size: form.parse("block_size")?,
            blocks: form.parse("blocks")?,
        })
    }
}

/// Details a backend announces in its LOGIN request.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Login {
    pub address: String,
    pub blocks: u64,
    pub block_size: usize,
}

impl Login {
    pub fn to_form(&self) -> Form {
        Form::new()
            .with("address", &self.address)
            .with("blocks", self.blocks)
            .with("block_size", self.block_size)
    }

    pub fn from_form(form: &Form) -> Result<Self, FormError> {
        Ok(Login {
            address: form.parse("address")?,
            blocks: form.parse("blocks")?,
            block_size: form.parse("block_size")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_tolerates_missing_newline() {
        let form = Form::decode(b"a=6\nb=7").unwrap();
        assert_eq!(form.parse::<u64>("a"), Ok(6));
        assert_eq!(form.parse::<u64>("b"), Ok(7));
        assert_eq!(form.encode(), b"a=6\nb=7\n".to_vec());
    }

    #[test]
    fn malformed_forms() {
        assert_eq!(Form::decode(b"novalue\n"), Err(FormError::NoSeparator(s!("novalue"))));
        assert_eq!(Form::decode(b"=1\n"), Err(FormError::EmptyKey(s!("=1"))));
        assert_eq!(Form::decode(b"a=1\na=2\n"), Err(FormError::DuplicateKey(s!("a"))));
        assert_eq!(Form::decode(&[0xff, b'=', b'1']), Err(FormError::NotUtf8));

        let form = Form::decode(b"a=x\n").unwrap();
        assert_eq!(form.parse::<u64>("a"), Err(FormError::InvalidValue(s!("a"))));
        assert_eq!(form.parse::<u64>("b"), Err(FormError::MissingKey(s!("b"))));
    }

    #[test]
    fn values_may_contain_separator() {
        let form = Form::decode(b"address=host=1\n").unwrap();
        assert_eq!(form.get("address"), Some("host=1"));
    }

    #[test]
    fn disk_info_form() {
        let info = DiskInfo {
            array: 1700000000123,
            index: 2,
            level: 3,
            disks: 4,
            block_size: 512,
            blocks: 64,
        };
        let decoded = Form::decode(&info.to_form().encode()).unwrap();
        assert_eq!(DiskInfo::from_form(&decoded), Ok(info));
        assert_eq!(
            DiskInfo::from_form(&Form::new().with("array", 1)),
            Err(FormError::MissingKey(s!("index")))
        );
    }
}
