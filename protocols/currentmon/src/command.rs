// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Requests and responses on the control port.
//!
//! Every request is a CBOR map whose `f` field names the command; the
//! firmware answers with one or more maps echoing `f` and carrying the
//! success flag `s`. Remaining fields depend on the command and are kept
//! verbatim for the caller.

use super::{value::Value, Error};

/// Key naming the command in requests and responses.
pub const FUNCTION_KEY: &str = "f";

/// Key carrying the success flag in responses.
pub const SUCCESS_KEY: &str = "s";

/// Encode a request map for the control port.
pub fn encode_request(f: &str, args: &[(&str, Value)]) -> Result<Vec<u8>, Error> {
    let mut entries = Vec::with_capacity(args.len() + 1);
    entries.push((FUNCTION_KEY.to_string(), Value::from(f)));
    args.iter()
        .for_each(|(key, value)| entries.push((key.to_string(), value.clone())));
    Value::Map(entries).to_bytes()
}

/// A decoded response map from the control port.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    fields: Vec<(String, Value)>,
}

impl Response {
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        match Value::from_bytes(data)? {
            Value::Map(fields) => Ok(Response { fields }),
            _ => Err(Error::NotMap),
        }
    }

    /// All fields in wire order, unknown ones included.
    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Name of the command this response belongs to.
    pub fn function(&self) -> Result<&str, Error> {
        self.get(FUNCTION_KEY)
            .ok_or(Error::MissingField("f"))?
            .as_str()
            .ok_or(Error::FieldType("f"))
    }

    /// Success flag reported by the firmware.
    pub fn success(&self) -> Result<bool, Error> {
        self.get(SUCCESS_KEY)
            .ok_or(Error::MissingField("s"))?
            .as_bool()
            .ok_or(Error::FieldType("s"))
    }

    pub fn bool_field(&self, key: &'static str) -> Result<bool, Error> {
        self.get(key)
            .ok_or(Error::MissingField(key))?
            .as_bool()
            .ok_or(Error::FieldType(key))
    }

    pub fn u64_field(&self, key: &'static str) -> Result<u64, Error> {
        self.get(key)
            .ok_or(Error::MissingField(key))?
            .as_u64()
            .ok_or(Error::FieldType(key))
    }

    pub fn str_field(&self, key: &'static str) -> Result<&str, Error> {
        self.get(key)
            .ok_or(Error::MissingField(key))?
            .as_str()
            .ok_or(Error::FieldType(key))
    }

    pub fn bytes_field(&self, key: &'static str) -> Result<&[u8], Error> {
        self.get(key)
            .ok_or(Error::MissingField(key))?
            .as_bytes()
            .ok_or(Error::FieldType(key))
    }
}

/// Error flags reported in the `err` field of `cmd_status`.
pub mod device_error {
    pub const I2C: u32 = 1 << 0;
    pub const HAL: u32 = 1 << 1;
    pub const INIT: u32 = 1 << 2;
    pub const INIT_TMP: u32 = 1 << 3;
    pub const INIT_VMAIN: u32 = 1 << 4;
    pub const INIT_ADC: u32 = 1 << 5;
    pub const INIT_USBPD: u32 = 1 << 6;
    pub const TEMPERATURE: u32 = 1 << 8;
    pub const VOUT_FAILURE: u32 = 1 << 9;
    pub const CAL: u32 = 1 << 10;
    pub const PROBE_CON: u32 = 1 << 11;
    pub const SRC_CURRENT: u32 = 1 << 12;
    pub const SNK_CURRENT: u32 = 1 << 13;

    const TABLE: &[(u32, &str)] = &[
        (I2C, "I2C"),
        (HAL, "HAL"),
        (INIT, "INIT"),
        (INIT_TMP, "INIT_TMP"),
        (INIT_VMAIN, "INIT_VMAIN"),
        (INIT_ADC, "INIT_ADC"),
        (INIT_USBPD, "INIT_USBPD"),
        (TEMPERATURE, "TEMPERATURE"),
        (VOUT_FAILURE, "VOUT_FAILURE"),
        (CAL, "CAL"),
        (PROBE_CON, "PROBE_CON"),
        (SRC_CURRENT, "SRC_CURRENT"),
        (SNK_CURRENT, "SNK_CURRENT"),
    ];

    /// Names of the flags set in an error bitfield.
    pub fn names(bits: u32) -> Vec<&'static str> {
        TABLE
            .iter()
            .filter(|(bit, _)| bits & bit > 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Actions the firmware reports in the `err_act` field of `cmd_status`.
pub mod error_action {
    pub const DISCONNECT: u32 = 1 << 0;
    pub const RESET: u32 = 1 << 1;
    pub const LOCKOUT: u32 = 1 << 2;
    pub const SENDLOG: u32 = 1 << 3;

    const TABLE: &[(u32, &str)] = &[
        (DISCONNECT, "DISCONNECT"),
        (RESET, "RESET"),
        (LOCKOUT, "LOCKOUT"),
        (SENDLOG, "SENDLOG"),
    ];

    /// Names of the actions set in an action bitfield.
    pub fn names(bits: u32) -> Vec<&'static str> {
        TABLE
            .iter()
            .filter(|(bit, _)| bits & bit > 0)
            .map(|(_, name)| *name)
            .collect()
    }
}
